//! Database configuration, following the builder-with-validation pattern the
//! teacher uses for per-call options (`options.rs::UpdateOptionsBuilder`),
//! scaled up to the full configuration surface of spec.md §6.

use crate::error::{Error, Result};

pub const DEFAULT_PAGE_SIZE: u32 = 8192;
pub const MIN_PAGE_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    None,
    Journaled,
    Synced,
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::Synced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushInterval {
    Infinite,
    Millis(u64),
}

#[derive(Debug, Clone)]
pub struct Options {
    pub page_size: u32,
    pub cache_size: usize,
    pub enable_journaling: bool,
    pub wal_file_name_format: String,
    pub enable_auto_checkpoint: bool,
    pub timeout_ms: u64,
    pub read_only: bool,
    pub strict_mode: bool,
    pub database_name: String,
    pub user_data: Vec<u8>,
    pub enable_compression: bool,
    pub enable_encryption: bool,
    pub encryption_key: Option<Vec<u8>>,
    pub password: Option<String>,
    pub max_transaction_size: usize,
    pub max_transactions: usize,
    pub transaction_timeout_ms: u64,
    pub write_concern: WriteConcern,
    pub background_flush_interval: FlushInterval,
    pub journal_flush_delay_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: 1000,
            enable_journaling: true,
            wal_file_name_format: "{name}-wal.{ext}".to_string(),
            enable_auto_checkpoint: true,
            timeout_ms: 10_000,
            read_only: false,
            strict_mode: false,
            database_name: String::new(),
            user_data: Vec::new(),
            enable_compression: false,
            enable_encryption: false,
            encryption_key: None,
            password: None,
            max_transaction_size: 10_000,
            max_transactions: 128,
            transaction_timeout_ms: 30_000,
            write_concern: WriteConcern::Synced,
            background_flush_interval: FlushInterval::Infinite,
            journal_flush_delay_ms: 0,
        }
    }
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Validates the combination of options per spec.md §6. Called once by
    /// `Engine::open`/`Engine::open_with_options`.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "page_size must be a power of two >= {}, got {}",
                MIN_PAGE_SIZE, self.page_size
            )));
        }
        if self.cache_size == 0 {
            return Err(Error::InvalidArgument("cache_size must be > 0".into()));
        }
        if self.timeout_ms == 0 {
            return Err(Error::InvalidArgument("timeout must be > 0".into()));
        }
        if self.database_name.len() > 63 || self.database_name.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument(
                "database_name must be <= 63 UTF-8 bytes with no NUL".into(),
            ));
        }
        if self.user_data.len() > 64 {
            return Err(Error::InvalidArgument("user_data must be <= 64 bytes".into()));
        }
        if self.enable_encryption {
            match &self.encryption_key {
                Some(key) if key.len() >= 16 => {}
                _ => {
                    return Err(Error::InvalidArgument(
                        "encryption_key must be >= 16 bytes when enable_encryption is set".into(),
                    ))
                }
            }
        }
        if let Some(password) = &self.password {
            if password.len() < 6 {
                return Err(Error::InvalidArgument("password must be >= 6 chars".into()));
            }
        }
        if self.max_transaction_size == 0 {
            return Err(Error::InvalidArgument("max_transaction_size must be > 0".into()));
        }
        if self.max_transactions == 0 {
            return Err(Error::InvalidArgument("max_transactions must be > 0".into()));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(Error::InvalidArgument("transaction_timeout must be > 0".into()));
        }
        Ok(())
    }

    /// Resolves the WAL file path for a given database file path, applying
    /// the `{name}`/`{ext}` format substitution rules of spec.md §6.
    pub fn wal_path(&self, db_path: &std::path::Path) -> std::path::PathBuf {
        let dir = db_path.parent().filter(|p| !p.as_os_str().is_empty());
        let stem = db_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = db_path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let format = if self.wal_file_name_format.trim().is_empty() {
            "{name}.wal".to_string()
        } else {
            self.wal_file_name_format.clone()
        };

        let mut name = format.replace("{name}", &stem).replace("{ext}", &ext);
        if !name.contains('.') {
            if !ext.is_empty() {
                name.push('.');
                name.push_str(&ext);
            } else {
                name.push_str(".wal");
            }
        }

        match dir {
            Some(dir) => dir.join(name),
            None => std::path::PathBuf::from(name),
        }
    }
}

pub struct OptionsBuilder {
    options: Options,
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        OptionsBuilder {
            options: Options::default(),
        }
    }
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.options.$name = value;
            self
        }
    };
}

impl OptionsBuilder {
    setter!(page_size, u32);
    setter!(cache_size, usize);
    setter!(enable_journaling, bool);
    setter!(enable_auto_checkpoint, bool);
    setter!(timeout_ms, u64);
    setter!(read_only, bool);
    setter!(strict_mode, bool);
    setter!(enable_compression, bool);
    setter!(enable_encryption, bool);
    setter!(max_transaction_size, usize);
    setter!(max_transactions, usize);
    setter!(transaction_timeout_ms, u64);
    setter!(write_concern, WriteConcern);
    setter!(background_flush_interval, FlushInterval);
    setter!(journal_flush_delay_ms, u64);

    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.options.database_name = name.into();
        self
    }

    pub fn user_data(mut self, data: Vec<u8>) -> Self {
        self.options.user_data = data;
        self
    }

    pub fn encryption_key(mut self, key: Vec<u8>) -> Self {
        self.options.encryption_key = Some(key);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.options.password = Some(password.into());
        self
    }

    pub fn wal_file_name_format(mut self, format: impl Into<String>) -> Self {
        self.options.wal_file_name_format = format.into();
        self
    }

    pub fn build(self) -> Result<Options> {
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let opts = Options::builder().page_size(5000).build();
        assert!(opts.is_err());
    }

    #[test]
    fn rejects_small_page_size() {
        let opts = Options::builder().page_size(2048).build();
        assert!(opts.is_err());
    }

    #[test]
    fn rejects_short_password() {
        let opts = Options::builder().password("abc").build();
        assert!(opts.is_err());
    }

    #[test]
    fn rejects_encryption_without_key() {
        let opts = Options::builder().enable_encryption(true).build();
        assert!(opts.is_err());
    }

    #[test]
    fn accepts_encryption_with_sufficient_key() {
        let opts = Options::builder()
            .enable_encryption(true)
            .encryption_key(vec![0u8; 16])
            .build();
        assert!(opts.is_ok());
    }

    #[test]
    fn wal_path_uses_default_format() {
        let opts = Options::default();
        let path = opts.wal_path(std::path::Path::new("/tmp/my.db"));
        assert_eq!(path, std::path::PathBuf::from("/tmp/my-wal.db"));
    }

    #[test]
    fn wal_path_falls_back_to_wal_extension_when_format_has_no_extension_token() {
        let opts = Options::builder()
            .wal_file_name_format("{name}_log")
            .build()
            .unwrap();
        let path = opts.wal_path(std::path::Path::new("/tmp/my.db"));
        assert_eq!(path, std::path::PathBuf::from("/tmp/my_log.db"));
    }

    #[test]
    fn wal_path_empty_format_falls_back_to_dot_wal() {
        let opts = Options::builder()
            .wal_file_name_format("")
            .build()
            .unwrap();
        let path = opts.wal_path(std::path::Path::new("/tmp/my.db"));
        assert_eq!(path, std::path::PathBuf::from("/tmp/my.wal"));
    }
}
