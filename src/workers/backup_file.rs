//! The `backup-file` job: stream one cluster file into the repository.

use pgvault_api_types::{CipherType, Error, Result};
use pgvault_protocol::Value;
use pgvault_storage::filter::{
    block_digest, BlockMap, BlockMapEntry, HashFilter, PageChecksumFilter, SizeFilter, SHA1_EMPTY,
};
use pgvault_storage::{ReadOptions, Storage, WriteOptions};

use super::WorkerConfig;

pub fn run(config: &WorkerConfig, param: &Value) -> Result<Value> {
    let source_file = param.get("source-file").as_str()?;
    let repo_file = param.get("repo-file").as_str()?;
    let compress = param.get("compress").as_bool()?;
    let checksum_page = param.get("checksum-page").as_bool().unwrap_or(false);
    let lsn_limit = param.get("lsn-limit").as_u64().unwrap_or(u64::MAX);
    let prior_checksum = param.get("prior-checksum").as_opt_str()?;

    let pg = config.pg();
    let repo = config.repo();

    // Delta mode: hash the source first; if it still matches the prior
    // backup the file is referenced instead of copied.
    if let Some(prior) = prior_checksum {
        match source_checksum(&pg, source_file)? {
            Some((checksum, size)) if checksum == prior => {
                return Ok(Value::obj([
                    ("result", Value::from("reference")),
                    ("checksum", Value::from(checksum)),
                    ("size", Value::from(size)),
                ]));
            }
            Some(_) => (),
            None => return Ok(missing_result()),
        }
    }

    if !param.get("block-incr").is_null() {
        return block_incr_copy(config, &pg, &repo, source_file, repo_file, param);
    }

    let mut read = match pg.new_read(source_file, ReadOptions::default().ignore_missing(true))? {
        Some(read) => read,
        // Dropped relation between enumeration and copy; not an error.
        None => return Ok(missing_result()),
    };

    if checksum_page {
        read.filters_mut()
            .add(Box::new(PageChecksumFilter::new(0, lsn_limit)));
    }
    read.filters_mut()
        .add(Box::new(HashFilter::sha1()?))
        .add(Box::new(SizeFilter::new()));

    let mut write = repo.new_write(repo_file, WriteOptions::default())?;
    super::repo_write_filters(&mut write, config, compress)?;

    let (read_filters, write_filters) = Storage::copy(read, write)?;

    let mut result = vec![
        ("result", Value::from("copied")),
        (
            "checksum",
            read_filters.result_required("hash")?.clone(),
        ),
        ("size", read_filters.result_required("size")?.clone()),
        (
            "checksum-repo",
            write_filters.result_required("hash")?.clone(),
        ),
        ("repo-size", write_filters.result_required("size")?.clone()),
    ];

    if checksum_page {
        let page = read_filters.result_required("page-checksum")?;
        result.push(("page-valid", page.get("valid").clone()));
        result.push(("page-errors", page.get("error").clone()));
    }

    Ok(Value::Object(
        result
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    ))
}

fn missing_result() -> Value {
    Value::obj([("result", Value::from("missing"))])
}

fn source_checksum(pg: &Storage, source_file: &str) -> Result<Option<(String, u64)>> {
    let mut read = match pg.new_read(source_file, ReadOptions::default().ignore_missing(true))? {
        Some(read) => read,
        None => return Ok(None),
    };

    read.filters_mut()
        .add(Box::new(HashFilter::sha1()?))
        .add(Box::new(SizeFilter::new()));
    read.drain()?;

    let checksum = read.filters().result_required("hash")?.as_str()?.to_string();
    let size = read.filters().result_required("size")?.as_u64()?;
    Ok(Some((checksum, size)))
}

/// Copy only the blocks that changed against the prior map, then append the
/// new map. Block-incremental files are stored without compression or
/// encryption so restore can fetch individual blocks with ranged reads.
fn block_incr_copy(
    config: &WorkerConfig,
    pg: &Storage,
    repo: &Storage,
    source_file: &str,
    repo_file: &str,
    param: &Value,
) -> Result<Value> {
    if config.cipher_type != CipherType::None {
        return Err(Error::assert(
            "block incremental is not supported on an encrypted repository",
        ));
    }

    let spec = param.get("block-incr");
    let block_size = spec.get("block-size").as_u64()?;
    let label = param.get("label").as_str()?;

    let prior_map = match spec.get("map-file").as_opt_str()? {
        Some(map_file) => {
            let offset = spec.get("map-offset").as_u64()?;
            let size = spec.get("map-size").as_u64()?;

            let mut read = repo.open_read(
                map_file,
                ReadOptions::default().range(offset, Some(size)),
            )?;
            Some(BlockMap::from_bytes(&read.read_all()?)?)
        }
        None => None,
    };

    let mut read = match pg.new_read(source_file, ReadOptions::default().ignore_missing(true))? {
        Some(read) => read,
        None => return Ok(missing_result()),
    };
    read.filters_mut()
        .add(Box::new(HashFilter::sha1()?))
        .add(Box::new(SizeFilter::new()));

    let mut write = repo.new_write(repo_file, WriteOptions::default())?;
    write
        .filters_mut()
        .add(Box::new(HashFilter::sha1()?))
        .add(Box::new(SizeFilter::new()));

    let mut map = BlockMap::new(block_size);
    let current_label = map.label_idx(label);

    let mut pending: Vec<u8> = Vec::new();
    let mut block_no: usize = 0;
    let mut written: u64 = 0;
    let mut copied_blocks: u64 = 0;

    let mut flush_block = |block: &[u8],
                           block_no: usize,
                           map: &mut BlockMap,
                           write: &mut pgvault_storage::StorageWrite,
                           written: &mut u64,
                           copied_blocks: &mut u64|
     -> Result<()> {
        let digest = block_digest(block)?;

        // Unchanged blocks keep their prior reference.
        if let Some(prior) = &prior_map {
            if let Some(entry) = prior.entries.get(block_no) {
                if entry.checksum == digest {
                    let reference = map.label_idx(prior.label(entry.reference)?);
                    map.entries.push(BlockMapEntry {
                        reference,
                        offset: entry.offset,
                        size: entry.size,
                        checksum: digest,
                    });
                    return Ok(());
                }
            }
        }

        write.write(block)?;
        map.entries.push(BlockMapEntry {
            reference: current_label,
            offset: *written,
            size: block.len() as u64,
            checksum: digest,
        });
        *written += block.len() as u64;
        *copied_blocks += 1;
        Ok(())
    };

    while let Some(chunk) = read.read_block()? {
        pending.extend_from_slice(&chunk);

        while pending.len() as u64 >= block_size {
            let block: Vec<u8> = pending.drain(..block_size as usize).collect();
            flush_block(&block, block_no, &mut map, &mut write, &mut written, &mut copied_blocks)?;
            block_no += 1;
        }
    }

    if !pending.is_empty() {
        let block = std::mem::take(&mut pending);
        flush_block(&block, block_no, &mut map, &mut write, &mut written, &mut copied_blocks)?;
    }

    let map_bytes = map.to_bytes();
    write.write(&map_bytes)?;
    let write_filters = write.close()?;

    let filters = read.into_filters();
    let checksum = filters
        .result("hash")
        .and_then(|value| value.as_str().ok())
        .unwrap_or(SHA1_EMPTY)
        .to_string();
    let size = filters.result_required("size")?.as_u64()?;

    Ok(Value::obj([
        ("result", Value::from("copied")),
        ("checksum", Value::from(checksum)),
        ("size", Value::from(size)),
        ("checksum-repo", write_filters.result_required("hash")?.clone()),
        ("repo-size", write_filters.result_required("size")?.clone()),
        ("map-size", Value::from(map_bytes.len())),
        ("block-size", Value::from(block_size)),
        ("copied-blocks", Value::from(copied_blocks)),
    ]))
}
