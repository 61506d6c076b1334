use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

pub const REFERRAL_KEY: &str = "referral_code";
pub const AUTH_ROUTE: &str = "/auth";

/// Durable local key/value storage.
pub trait KeyValueStore {
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigateOptions {
    /// Replace the current history entry instead of pushing one
    pub replace: bool,
}

pub trait Navigator {
    fn redirect(&mut self, path: &str, options: NavigateOptions);
}

/// JSON object on disk. Writes go through a temp file and a rename.
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| SyncError::Storage(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }

    fn flush(&self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.values)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Navigator for a headless client: remembers where it was sent.
#[derive(Debug, Default)]
pub struct LogNavigator {
    pub current: Option<String>,
    pub history: Vec<String>,
}

impl Navigator for LogNavigator {
    fn redirect(&mut self, path: &str, options: NavigateOptions) {
        tracing::info!(path, replace = options.replace, "navigate");
        if options.replace {
            self.history.pop();
        }
        self.history.push(path.to_string());
        self.current = Some(path.to_string());
    }
}

/// One-shot referral capture: store the code (uppercased, overwriting any
/// earlier one) if there is one, then always hand off to auth without
/// leaving this route in history. A storage failure does not block the
/// redirect.
pub fn capture<S, N>(code: Option<&str>, store: &mut S, nav: &mut N) -> &'static str
where
    S: KeyValueStore,
    N: Navigator,
{
    if let Some(code) = code.filter(|c| !c.trim().is_empty()) {
        let code = code.to_uppercase();
        if let Some(previous) = store.get(REFERRAL_KEY) {
            tracing::debug!(previous = %previous, "replacing stored referral code");
        }
        match store.set(REFERRAL_KEY, &code) {
            Ok(()) => tracing::info!(code = %code, "referral code captured"),
            Err(e) => tracing::warn!("could not persist referral code: {}", e),
        }
    }
    nav.redirect(AUTH_ROUTE, NavigateOptions { replace: true });
    AUTH_ROUTE
}
