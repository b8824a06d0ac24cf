//! Page-1 `DatabaseHeader`: magic, version, page-size/counters, flags,
//! database name, user data, optional security metadata, and a CRC32 over
//! the rest. Byte-offset accessor style grounded on the teacher's
//! `page/header_page_wrapper.rs`.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

pub const HEADER_DOC_SIZE: usize = 256;
pub const MAGIC: u32 = 0x4442_5353;
pub const VERSION: u32 = 0x0001_0000;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_TOTAL_PAGES: usize = 12;
const OFF_USED_PAGES: usize = 16;
const OFF_COLLECTION_ROOT: usize = 20;
const OFF_CREATED_AT: usize = 24;
const OFF_MODIFIED_AT: usize = 32;
const OFF_FLAGS: usize = 40;
const OFF_DB_NAME: usize = 44;
const DB_NAME_LEN: usize = 63;
const OFF_USER_DATA: usize = OFF_DB_NAME + DB_NAME_LEN; // 107
const USER_DATA_LEN: usize = 64;
const OFF_SECURITY_PRESENT: usize = OFF_USER_DATA + USER_DATA_LEN; // 171
const OFF_SALT: usize = OFF_SECURITY_PRESENT + 1; // 172
const SALT_LEN: usize = 16;
const OFF_KEY_HASH: usize = OFF_SALT + SALT_LEN; // 188
const KEY_HASH_LEN: usize = 32;
const OFF_CHECKSUM: usize = HEADER_DOC_SIZE - 4; // 252

const FLAG_JOURNALING: u32 = 1 << 0;
const FLAG_COMPRESSION: u32 = 1 << 1;
const FLAG_ENCRYPTION: u32 = 1 << 2;

#[derive(Debug, Clone, Default)]
pub struct SecurityMetadata {
    pub salt: [u8; SALT_LEN],
    pub key_hash: [u8; KEY_HASH_LEN],
}

#[derive(Debug, Clone)]
pub struct DatabaseHeader {
    pub page_size: u32,
    pub total_pages: u32,
    pub used_pages: u32,
    pub collection_root_page_id: u32,
    pub created_at: u64,
    pub modified_at: u64,
    pub journaling_enabled: bool,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub database_name: String,
    pub user_data: Vec<u8>,
    pub security: Option<SecurityMetadata>,
}

impl DatabaseHeader {
    pub fn new(page_size: u32, now: u64) -> DatabaseHeader {
        DatabaseHeader {
            page_size,
            total_pages: 1,
            used_pages: 1,
            collection_root_page_id: 0,
            created_at: now,
            modified_at: now,
            journaling_enabled: true,
            compression_enabled: false,
            encryption_enabled: false,
            database_name: String::new(),
            user_data: Vec::new(),
            security: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.page_size.is_power_of_two()
            && self.page_size >= 4096
            && self.total_pages > 0
            && self.used_pages <= self.total_pages
            && self.created_at > 0
            && self.modified_at >= self.created_at
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_DOC_SIZE];
        BigEndian::write_u32(&mut buf[OFF_MAGIC..], MAGIC);
        BigEndian::write_u32(&mut buf[OFF_VERSION..], VERSION);
        BigEndian::write_u32(&mut buf[OFF_PAGE_SIZE..], self.page_size);
        BigEndian::write_u32(&mut buf[OFF_TOTAL_PAGES..], self.total_pages);
        BigEndian::write_u32(&mut buf[OFF_USED_PAGES..], self.used_pages);
        BigEndian::write_u32(&mut buf[OFF_COLLECTION_ROOT..], self.collection_root_page_id);
        BigEndian::write_u64(&mut buf[OFF_CREATED_AT..], self.created_at);
        BigEndian::write_u64(&mut buf[OFF_MODIFIED_AT..], self.modified_at);

        let mut flags = 0u32;
        if self.journaling_enabled {
            flags |= FLAG_JOURNALING;
        }
        if self.compression_enabled {
            flags |= FLAG_COMPRESSION;
        }
        if self.encryption_enabled {
            flags |= FLAG_ENCRYPTION;
        }
        BigEndian::write_u32(&mut buf[OFF_FLAGS..], flags);

        let name_bytes = self.database_name.as_bytes();
        let copy_len = name_bytes.len().min(DB_NAME_LEN - 1);
        buf[OFF_DB_NAME..OFF_DB_NAME + copy_len].copy_from_slice(&name_bytes[..copy_len]);
        // remainder stays NUL (vec is zero-initialized)

        let ud_len = self.user_data.len().min(USER_DATA_LEN);
        buf[OFF_USER_DATA..OFF_USER_DATA + ud_len].copy_from_slice(&self.user_data[..ud_len]);

        if let Some(sec) = &self.security {
            buf[OFF_SECURITY_PRESENT] = 1;
            buf[OFF_SALT..OFF_SALT + SALT_LEN].copy_from_slice(&sec.salt);
            buf[OFF_KEY_HASH..OFF_KEY_HASH + KEY_HASH_LEN].copy_from_slice(&sec.key_hash);
        }

        let checksum = crc32fast::hash(&buf[..OFF_CHECKSUM]);
        BigEndian::write_u32(&mut buf[OFF_CHECKSUM..], checksum);

        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<DatabaseHeader> {
        if buf.len() < HEADER_DOC_SIZE {
            return Err(Error::InvalidDatabase("header page too short".into()));
        }

        let magic = BigEndian::read_u32(&buf[OFF_MAGIC..]);
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let stored_checksum = BigEndian::read_u32(&buf[OFF_CHECKSUM..]);
        let actual_checksum = crc32fast::hash(&buf[..OFF_CHECKSUM]);
        if stored_checksum != actual_checksum {
            return Err(Error::HeaderChecksumMismatch);
        }

        let version = BigEndian::read_u32(&buf[OFF_VERSION..]);
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let page_size = BigEndian::read_u32(&buf[OFF_PAGE_SIZE..]);
        let total_pages = BigEndian::read_u32(&buf[OFF_TOTAL_PAGES..]);
        let used_pages = BigEndian::read_u32(&buf[OFF_USED_PAGES..]);
        let collection_root_page_id = BigEndian::read_u32(&buf[OFF_COLLECTION_ROOT..]);
        let created_at = BigEndian::read_u64(&buf[OFF_CREATED_AT..]);
        let modified_at = BigEndian::read_u64(&buf[OFF_MODIFIED_AT..]);
        let flags = BigEndian::read_u32(&buf[OFF_FLAGS..]);

        let zero_pos = buf[OFF_DB_NAME..OFF_DB_NAME + DB_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DB_NAME_LEN);
        let database_name =
            String::from_utf8_lossy(&buf[OFF_DB_NAME..OFF_DB_NAME + zero_pos]).into_owned();

        let user_data = buf[OFF_USER_DATA..OFF_USER_DATA + USER_DATA_LEN].to_vec();

        let security = if buf[OFF_SECURITY_PRESENT] != 0 {
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(&buf[OFF_SALT..OFF_SALT + SALT_LEN]);
            let mut key_hash = [0u8; KEY_HASH_LEN];
            key_hash.copy_from_slice(&buf[OFF_KEY_HASH..OFF_KEY_HASH + KEY_HASH_LEN]);
            Some(SecurityMetadata { salt, key_hash })
        } else {
            None
        };

        let header = DatabaseHeader {
            page_size,
            total_pages,
            used_pages,
            collection_root_page_id,
            created_at,
            modified_at,
            journaling_enabled: flags & FLAG_JOURNALING != 0,
            compression_enabled: flags & FLAG_COMPRESSION != 0,
            encryption_enabled: flags & FLAG_ENCRYPTION != 0,
            database_name,
            user_data,
            security,
        };

        if !header.is_valid() {
            return Err(Error::InvalidDatabase("header fields fail validation".into()));
        }

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut header = DatabaseHeader::new(8192, 1000);
        header.database_name = "mydb".to_string();
        header.user_data = vec![1, 2, 3];
        header.collection_root_page_id = 5;
        header.total_pages = 10;
        header.used_pages = 3;
        header.modified_at = 2000;

        let bytes = header.to_bytes();
        let parsed = DatabaseHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.database_name, "mydb");
        assert_eq!(&parsed.user_data[..3], &[1u8, 2, 3]);
        assert_eq!(parsed.collection_root_page_id, 5);
        assert_eq!(parsed.total_pages, 10);
        assert_eq!(parsed.used_pages, 3);
    }

    #[test]
    fn rejects_bad_magic() {
        let header = DatabaseHeader::new(8192, 1);
        let mut bytes = header.to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(DatabaseHeader::from_bytes(&bytes), Err(Error::InvalidMagic)));
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let header = DatabaseHeader::new(8192, 1);
        let mut bytes = header.to_bytes();
        bytes[50] ^= 0xFF;
        assert!(matches!(
            DatabaseHeader::from_bytes(&bytes),
            Err(Error::HeaderChecksumMismatch)
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let header = DatabaseHeader::new(8192, 1);
        let mut bytes = header.to_bytes();
        BigEndian::write_u32(&mut bytes[OFF_VERSION..], 0x0002_0000);
        let checksum = crc32fast::hash(&bytes[..OFF_CHECKSUM]);
        BigEndian::write_u32(&mut bytes[OFF_CHECKSUM..], checksum);
        assert!(matches!(
            DatabaseHeader::from_bytes(&bytes),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn is_valid_rejects_inconsistent_pages() {
        let mut header = DatabaseHeader::new(8192, 1);
        header.used_pages = 5;
        header.total_pages = 2;
        assert!(!header.is_valid());
    }
}
