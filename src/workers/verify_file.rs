//! The `verify-file` job: check one repository file against its recorded
//! checksum and size, reporting a classified reason instead of failing.

use pgvault_api_types::{ErrorKind, Result};
use pgvault_protocol::Value;
use pgvault_storage::filter::{HashFilter, SizeFilter};
use pgvault_storage::ReadOptions;

use super::WorkerConfig;

pub const REASON_OK: &str = "ok";
pub const REASON_FILE_MISSING: &str = "fileMissing";
pub const REASON_CHECKSUM_MISMATCH: &str = "checksumMismatch";
pub const REASON_SIZE_INVALID: &str = "sizeInvalid";
pub const REASON_OTHER: &str = "otherError";

pub fn run(config: &WorkerConfig, param: &Value) -> Result<Value> {
    let file = param.get("file").as_str()?;
    let expected_checksum = param.get("checksum").as_str()?;
    let expected_size = match param.get("size") {
        Value::Null => None,
        other => Some(other.as_u64()?),
    };
    let compressed = param.get("compress").as_bool()?;
    // Stored checksum of the repository bytes themselves, when recorded;
    // cheaper than decoding and just as strong.
    let repo_verify = param.get("verify-repo").as_bool().unwrap_or(false);

    let offset = param.get("offset").as_u64().unwrap_or(0);
    let limit = match param.get("limit") {
        Value::Null => None,
        other => Some(other.as_u64()?),
    };

    let repo = config.repo();

    let options = ReadOptions::default().ignore_missing(true).range(offset, limit);

    let mut read = match repo.new_read(file, options) {
        Ok(Some(read)) => read,
        Ok(None) => return Ok(reason(REASON_FILE_MISSING, None)),
        Err(err) => return Ok(reason(REASON_OTHER, Some(&err.to_string()))),
    };

    if repo_verify {
        read.filters_mut()
            .add(Box::new(HashFilter::sha1()?))
            .add(Box::new(SizeFilter::new()));
    } else if super::repo_read_filters(&mut read, config, compressed).is_err() {
        return Ok(reason(REASON_OTHER, Some("unable to build filter chain")));
    }

    match read.drain() {
        Ok(()) => (),
        Err(err) if err.kind() == ErrorKind::FileMissing => {
            return Ok(reason(REASON_FILE_MISSING, None))
        }
        // Corrupt compression or encryption framing means the recorded
        // checksum can never be reproduced.
        Err(err) => return Ok(reason(REASON_CHECKSUM_MISMATCH, Some(&err.to_string()))),
    }

    let actual_checksum = match read.filters().result_required("hash") {
        Ok(value) => value.as_str()?.to_string(),
        Err(err) => return Ok(reason(REASON_OTHER, Some(&err.to_string()))),
    };
    let actual_size = read.filters().result_required("size")?.as_u64()?;

    if let Some(expected_size) = expected_size {
        if actual_size != expected_size {
            return Ok(reason(
                REASON_SIZE_INVALID,
                Some(&format!("size {actual_size}, expected {expected_size}")),
            ));
        }
    }

    if actual_checksum != expected_checksum {
        return Ok(reason(
            REASON_CHECKSUM_MISMATCH,
            Some(&format!("checksum {actual_checksum}, expected {expected_checksum}")),
        ));
    }

    Ok(reason(REASON_OK, None))
}

fn reason(kind: &str, message: Option<&str>) -> Value {
    match message {
        Some(message) => Value::obj([
            ("result", Value::from(kind)),
            ("message", Value::from(message)),
        ]),
        None => Value::obj([("result", Value::from(kind))]),
    }
}
