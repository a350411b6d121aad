//! Block cipher filter.
//!
//! AES-256-CBC in the standard OpenSSL salted envelope: a `Salted__` magic,
//! eight bytes of salt, then the PKCS#7 padded ciphertext. The key and IV
//! are derived from the passphrase and salt, so any tool speaking the
//! envelope format can decrypt repository files given the passphrase. Raw
//! mode drops the header and padding for well-bounded blobs whose size is a
//! cipher-block multiple.

use openssl::hash::MessageDigest;
use openssl::pkcs5::bytes_to_key;
use openssl::symm::{Cipher, Crypter, Mode};

use pgvault_api_types::{CipherType, Error, ErrorKind, Result};
use pgvault_protocol::Value;

use super::Filter;

pub const CIPHER_FILTER: &str = "cipher";

pub const CIPHER_MAGIC: &[u8; 8] = b"Salted__";
const SALT_SIZE: usize = 8;
const HEADER_SIZE: usize = CIPHER_MAGIC.len() + SALT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

pub struct CipherFilter {
    mode: CipherMode,
    pass: Vec<u8>,
    raw: bool,
    crypter: Option<Crypter>,
    /// Decrypt only: header bytes collected so far.
    header: Vec<u8>,
    finished: bool,
}

impl CipherFilter {
    pub fn new(mode: CipherMode, cipher_type: CipherType, pass: &[u8]) -> Result<Self> {
        Self::build(mode, cipher_type, pass, false)
    }

    /// Raw mode: no envelope and no padding. The caller owns block
    /// alignment.
    pub fn raw(mode: CipherMode, cipher_type: CipherType, pass: &[u8]) -> Result<Self> {
        Self::build(mode, cipher_type, pass, true)
    }

    fn build(mode: CipherMode, cipher_type: CipherType, pass: &[u8], raw: bool) -> Result<Self> {
        if cipher_type != CipherType::Aes256Cbc {
            return Err(Error::assert("cipher filter requires a cipher type"));
        }

        if pass.is_empty() {
            return Err(Error::new(ErrorKind::Crypto, "cipher passphrase is empty"));
        }

        let mut filter = Self {
            mode,
            pass: pass.to_vec(),
            raw,
            crypter: None,
            header: Vec::new(),
            finished: false,
        };

        if raw {
            filter.init(None)?;
        }

        Ok(filter)
    }

    fn init(&mut self, salt: Option<&[u8]>) -> Result<()> {
        let cipher = Cipher::aes_256_cbc();
        let derived = bytes_to_key(cipher, MessageDigest::sha1(), &self.pass, salt, 1)?;

        let mode = match self.mode {
            CipherMode::Encrypt => Mode::Encrypt,
            CipherMode::Decrypt => Mode::Decrypt,
        };

        let mut crypter = Crypter::new(cipher, mode, &derived.key, derived.iv.as_deref())?;
        crypter.pad(!self.raw);
        self.crypter = Some(crypter);

        Ok(())
    }

    fn update(crypter: &mut Crypter, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if input.is_empty() {
            return Ok(());
        }

        let block_size = Cipher::aes_256_cbc().block_size();
        let start = out.len();
        out.resize(start + input.len() + block_size, 0);

        let written = crypter.update(&input[..], &mut out[start..])?;
        out.truncate(start + written);

        Ok(())
    }
}

impl Filter for CipherFilter {
    fn name(&self) -> &'static str {
        CIPHER_FILTER
    }

    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.finished {
            return Err(Error::assert("cipher filter already finished"));
        }

        match self.mode {
            CipherMode::Encrypt => {
                if self.crypter.is_none() {
                    // First output: generate the salt and write the envelope.
                    let mut salt = [0u8; SALT_SIZE];
                    openssl::rand::rand_bytes(&mut salt)?;

                    out.extend_from_slice(CIPHER_MAGIC);
                    out.extend_from_slice(&salt);
                    self.init(Some(&salt))?;
                }

                let crypter = self.crypter.as_mut().unwrap();
                Self::update(crypter, input, out)
            }
            CipherMode::Decrypt => {
                let mut input = input;

                if self.crypter.is_none() {
                    // Collect the envelope before any ciphertext is visible.
                    let need = HEADER_SIZE - self.header.len();
                    let take = need.min(input.len());
                    self.header.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    if self.header.len() < HEADER_SIZE {
                        return Ok(());
                    }

                    if &self.header[..CIPHER_MAGIC.len()] != CIPHER_MAGIC {
                        return Err(Error::new(
                            ErrorKind::Crypto,
                            "cipher header missing, is the file encrypted?",
                        ));
                    }

                    let salt = self.header[CIPHER_MAGIC.len()..].to_vec();
                    self.init(Some(&salt))?;
                }

                let crypter = self.crypter.as_mut().unwrap();
                Self::update(crypter, input, out)
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Value> {
        if self.finished {
            return Err(Error::assert("cipher filter already finished"));
        }

        if self.crypter.is_none() {
            match self.mode {
                // Even an empty plaintext gets an envelope and a padding
                // block, so the output is recognizably encrypted.
                CipherMode::Encrypt => {
                    self.process(&[], out)?;
                }
                CipherMode::Decrypt => {
                    self.finished = true;
                    return Err(Error::new(
                        ErrorKind::Crypto,
                        "encrypted data is truncated before the header",
                    ));
                }
            }
        }

        self.finished = true;

        let crypter = self.crypter.as_mut().unwrap();

        let block_size = Cipher::aes_256_cbc().block_size();
        let start = out.len();
        out.resize(start + block_size * 2, 0);

        let written = crypter
            .finalize(&mut out[start..])
            .map_err(|_| Error::new(ErrorKind::Crypto, "unable to finalize cipher, wrong passphrase or corrupt data"))?;
        out.truncate(start + written);

        Ok(Value::Null)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run(filter: &mut CipherFilter, data: &[u8], chunk: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        for block in data.chunks(chunk.max(1)) {
            filter.process(block, &mut out)?;
        }

        filter.finish(&mut out)?;
        Ok(out)
    }

    #[test]
    fn envelope_round_trip() {
        let data = b"cluster data that must not leak".repeat(100);

        let mut encrypt =
            CipherFilter::new(CipherMode::Encrypt, CipherType::Aes256Cbc, b"passphrase").unwrap();
        let encrypted = run(&mut encrypt, &data, 777).unwrap();

        assert_eq!(&encrypted[..8], CIPHER_MAGIC);
        assert_ne!(encrypted[16..].to_vec(), data);

        let mut decrypt =
            CipherFilter::new(CipherMode::Decrypt, CipherType::Aes256Cbc, b"passphrase").unwrap();
        let decrypted = run(&mut decrypt, &encrypted, 13).unwrap();

        assert_eq!(decrypted, data);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let mut encrypt =
            CipherFilter::new(CipherMode::Encrypt, CipherType::Aes256Cbc, b"right").unwrap();
        let encrypted = run(&mut encrypt, b"secret data here", 100).unwrap();

        let mut decrypt =
            CipherFilter::new(CipherMode::Decrypt, CipherType::Aes256Cbc, b"wrong").unwrap();
        assert!(run(&mut decrypt, &encrypted, 100).is_err());
    }

    #[test]
    fn missing_header_fails() {
        let mut decrypt =
            CipherFilter::new(CipherMode::Decrypt, CipherType::Aes256Cbc, b"pass").unwrap();
        let err = run(&mut decrypt, b"Notsalted-and-not-encrypted", 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn truncated_header_fails() {
        let mut decrypt =
            CipherFilter::new(CipherMode::Decrypt, CipherType::Aes256Cbc, b"pass").unwrap();
        let err = run(&mut decrypt, b"Salted_", 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn empty_input_still_encrypts() {
        let mut encrypt =
            CipherFilter::new(CipherMode::Encrypt, CipherType::Aes256Cbc, b"pass").unwrap();
        let mut out = Vec::new();
        encrypt.finish(&mut out).unwrap();

        // Magic + salt + one padding block.
        assert_eq!(out.len(), 16 + 16);

        let mut decrypt =
            CipherFilter::new(CipherMode::Decrypt, CipherType::Aes256Cbc, b"pass").unwrap();
        let decrypted = run(&mut decrypt, &out, 5).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn raw_mode_has_no_envelope() {
        let data = [7u8; 32];

        let mut encrypt =
            CipherFilter::raw(CipherMode::Encrypt, CipherType::Aes256Cbc, b"pass").unwrap();
        let encrypted = run(&mut encrypt, &data, 32).unwrap();

        assert_eq!(encrypted.len(), 32);
        assert_ne!(&encrypted[..8], CIPHER_MAGIC);

        let mut decrypt =
            CipherFilter::raw(CipherMode::Decrypt, CipherType::Aes256Cbc, b"pass").unwrap();
        let decrypted = run(&mut decrypt, &encrypted, 32).unwrap();
        assert_eq!(decrypted, data);
    }
}
