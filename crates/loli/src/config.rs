use std::{fs, io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default number of return addresses kept per allocation.
pub const DEFAULT_MAX_FRAMES: usize = 30;

/// Default hook delay of a [`LoliConf`].
pub const DEFAULT_HOOK_DELAY: Duration = Duration::from_secs(5);

/// Default minimum record size of a [`LoliConf`].
pub const DEFAULT_MIN_RECORD_SIZE: usize = 512;

/// Default library list of a [`LoliConf`].
pub const DEFAULT_LIBRARIES: &str = "libil2cpp,libunity";

/// Immutable hook configuration, fixed at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    libraries: Vec<String>,
    min_record_size: usize,
    max_frames: usize,
}

impl HookConfig {
    /// Create a config from a comma separated library list such as `"libil2cpp,libunity,"`.
    ///
    /// Entries are trimmed, empty entries and repeats are dropped.
    pub fn new(min_record_size: usize, so_names: &str) -> Self {
        let mut libraries: Vec<String> = vec![];

        for name in so_names.split(',').map(str::trim) {
            if name.is_empty() || libraries.iter().any(|lib| lib == name) {
                continue;
            }

            libraries.push(name.to_string());
        }

        Self {
            libraries,
            min_record_size,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }

    /// Override the stack depth captured per allocation.
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn libraries(&self) -> &[String] {
        &self.libraries
    }

    pub fn min_record_size(&self) -> usize {
        self.min_record_size
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }
}

/// The line oriented bootstrap file read before a deferred install.
///
/// ```text
/// 5                    <- hook delay in seconds
/// 512                  <- minimum record size
/// libil2cpp,libunity   <- hooked libraries
/// ```
///
/// Missing or unparsable lines keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoliConf {
    pub delay: Duration,
    pub min_record_size: usize,
    pub libraries: String,
}

impl Default for LoliConf {
    fn default() -> Self {
        Self {
            delay: DEFAULT_HOOK_DELAY,
            min_record_size: DEFAULT_MIN_RECORD_SIZE,
            libraries: DEFAULT_LIBRARIES.to_string(),
        }
    }
}

impl LoliConf {
    pub fn parse(content: &str) -> Self {
        let mut conf = Self::default();

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();

            match index {
                0 => {
                    if let Ok(secs) = line.parse::<u64>() {
                        conf.delay = Duration::from_secs(secs);
                    }
                }
                1 => {
                    if let Ok(size) = line.parse::<usize>() {
                        conf.min_record_size = size;
                    }
                }
                2 => {
                    if !line.is_empty() {
                        conf.libraries = line.to_string();
                    }
                }
                _ => break,
            }
        }

        conf
    }

    /// Read the file at `path`, a missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "{} not found, using default hook settings",
                    path.as_ref().display()
                );
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn hook_config(&self) -> HookConfig {
        HookConfig::new(self.min_record_size, &self.libraries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_list_is_normalized() {
        let config = HookConfig::new(64, " libil2cpp , libunity,,libil2cpp,");

        assert_eq!(config.libraries(), ["libil2cpp", "libunity"]);
        assert_eq!(config.min_record_size(), 64);
        assert_eq!(config.max_frames(), DEFAULT_MAX_FRAMES);
    }

    #[test]
    fn empty_library_list() {
        assert!(HookConfig::new(0, " , ").libraries().is_empty());
    }

    #[test]
    fn conf_overrides_defaults_line_by_line() {
        let conf = LoliConf::parse("10\n1024\nlibgame,libengine\n");

        assert_eq!(conf.delay, Duration::from_secs(10));
        assert_eq!(conf.min_record_size, 1024);
        assert_eq!(
            conf.hook_config().libraries(),
            ["libgame", "libengine"]
        );
    }

    #[test]
    fn conf_keeps_defaults_for_bad_lines() {
        let conf = LoliConf::parse("soon\n\n");

        assert_eq!(conf, LoliConf::default());

        let conf = LoliConf::parse("1");

        assert_eq!(conf.delay, Duration::from_secs(1));
        assert_eq!(conf.min_record_size, DEFAULT_MIN_RECORD_SIZE);
        assert_eq!(conf.libraries, DEFAULT_LIBRARIES);
    }

    #[test]
    fn missing_conf_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("loli-missing-{}.conf", std::process::id()));

        assert_eq!(LoliConf::load(path).unwrap(), LoliConf::default());
    }
}
