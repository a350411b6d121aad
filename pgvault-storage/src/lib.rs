//! Storage drivers and the streaming filter chain.
//!
//! Everything the engine reads or writes goes through a [`Storage`] handle:
//! repository content, cluster files during backup and restore, spool and
//! lock paths. Filters attach to reads and writes to hash, compress and
//! encrypt data as it streams.

pub mod cifs;
pub mod filter;
pub mod posix;
pub mod read;
pub mod remote;
pub mod storage;
pub mod write;

pub use read::StorageRead;
pub use storage::{
    DriverWrite, FileType, InfoLevel, ReadOptions, Storage, StorageDriver, StorageEntry,
    StorageInfo, WriteOptions,
};
pub use write::StorageWrite;

/// I/O block size for streaming reads.
pub const BUFFER_SIZE: usize = 64 * 1024;


#[cfg(test)]
mod test {
    use pgvault_api_types::{CipherType, CompressType, ErrorKind};

    use super::filter::{
        CipherFilter, CipherMode, CompressFilter, DecompressFilter, HashFilter, SizeFilter,
    };
    use super::storage::{InfoLevel, ReadOptions, Storage, WriteOptions};
    use super::testutil::TempPath;
    use super::FileType;

    #[test]
    fn put_get_round_trip() {
        let tmp = TempPath::new("posix");
        let storage = Storage::posix(tmp.str());

        storage.put("dir/sub/file.txt", b"contents").unwrap();
        assert_eq!(storage.get("dir/sub/file.txt").unwrap().unwrap(), b"contents");
        assert_eq!(storage.get("missing").unwrap(), None);
    }

    #[test]
    fn atomic_write_hides_partial_content() {
        let tmp = TempPath::new("atomic");
        let storage = Storage::posix(tmp.str());

        let mut write = storage
            .new_write("file.bin", WriteOptions::default())
            .unwrap();
        write.write(b"partial").unwrap();

        // Not visible under the final name until close.
        assert!(!storage.exists("file.bin").unwrap());
        assert!(storage.exists("file.bin.tmp").unwrap());

        write.close().unwrap();
        assert!(storage.exists("file.bin").unwrap());
        assert!(!storage.exists("file.bin.tmp").unwrap());
    }

    #[test]
    fn abandoned_write_cleans_temp() {
        let tmp = TempPath::new("abandon");
        let storage = Storage::posix(tmp.str());

        let mut write = storage
            .new_write("file.bin", WriteOptions::default())
            .unwrap();
        write.write(b"partial").unwrap();
        drop(write);

        assert!(!storage.exists("file.bin").unwrap());
        assert!(!storage.exists("file.bin.tmp").unwrap());
    }

    #[test]
    fn list_is_sorted_and_missing_path_errors() {
        let tmp = TempPath::new("list");
        let storage = Storage::posix(tmp.str());

        storage.put("dir/b", b"b").unwrap();
        storage.put("dir/a", b"a").unwrap();
        storage.put("dir/c", b"c").unwrap();

        let names: Vec<String> = storage
            .list("dir", InfoLevel::Basic)
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);

        let err = storage.list("nodir", InfoLevel::Basic).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PathMissing);
        assert!(storage.list_opt("nodir", InfoLevel::Basic).unwrap().is_empty());
    }

    #[test]
    fn info_levels() {
        let tmp = TempPath::new("info");
        let storage = Storage::posix(tmp.str());
        storage.put("file", b"12345").unwrap();

        let info = storage.info("file", InfoLevel::Basic).unwrap();
        assert!(info.exists);
        assert_eq!(info.file_type, FileType::File);
        assert_eq!(info.size, 5);
        assert!(info.time > 0);

        let info = storage.info("gone", InfoLevel::Basic).unwrap();
        assert!(!info.exists);
    }

    #[test]
    fn ranged_read() {
        let tmp = TempPath::new("range");
        let storage = Storage::posix(tmp.str());
        storage.put("file", b"0123456789").unwrap();

        let mut read = storage
            .open_read("file", ReadOptions::default().range(2, Some(5)))
            .unwrap();
        assert_eq!(read.read_all().unwrap(), b"23456");
    }

    #[test]
    fn write_mode_and_time_are_applied() {
        use std::os::unix::fs::MetadataExt;

        let tmp = TempPath::new("meta");
        let storage = Storage::posix(tmp.str());

        let mut write = storage
            .new_write(
                "file",
                WriteOptions::default().mode(0o640).time_modified(1_600_000_000),
            )
            .unwrap();
        write.write(b"x").unwrap();
        write.close().unwrap();

        let meta = std::fs::metadata(tmp.path.join("file")).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o640);
        assert_eq!(meta.mtime(), 1_600_000_000);
    }

    /// The write chain compress-then-encrypt must invert through
    /// decrypt-then-decompress, with matching hashes on both sides.
    #[test]
    fn filter_pipeline_inverts() {
        let tmp = TempPath::new("pipeline");
        let storage = Storage::posix(tmp.str());

        let data: Vec<u8> = (0..200_000u32).map(|i| (i / 100) as u8).collect();
        let pass = b"repo-pass";

        let mut write = storage.new_write("blob", WriteOptions::default()).unwrap();
        write
            .filters_mut()
            .add(Box::new(HashFilter::sha1().unwrap()))
            .add(Box::new(SizeFilter::new()))
            .add(Box::new(CompressFilter::new(CompressType::Zst, None).unwrap()))
            .add(Box::new(
                CipherFilter::new(CipherMode::Encrypt, CipherType::Aes256Cbc, pass).unwrap(),
            ));
        write.write(&data).unwrap();
        let filters = write.close().unwrap();

        let source_hash = filters.result("hash").unwrap().as_str().unwrap().to_string();
        assert_eq!(filters.result("size").unwrap().as_u64().unwrap(), data.len() as u64);

        // Stored bytes are an encrypted envelope, not the plaintext.
        let stored = storage.get("blob").unwrap().unwrap();
        assert_eq!(&stored[..8], b"Salted__");
        assert!(stored.len() < data.len());

        let mut read = storage.open_read("blob", ReadOptions::default()).unwrap();
        read.filters_mut()
            .add(Box::new(
                CipherFilter::new(CipherMode::Decrypt, CipherType::Aes256Cbc, pass).unwrap(),
            ))
            .add(Box::new(DecompressFilter::new(CompressType::Zst).unwrap()))
            .add(Box::new(HashFilter::sha1().unwrap()));

        let output = read.read_all().unwrap();
        assert_eq!(output, data);
        assert_eq!(
            read.filters().result("hash").unwrap().as_str().unwrap(),
            source_hash
        );
    }
}
