use {
    anyhow::{Context as _, Result},
    serde::{Deserialize, Serialize},
    std::path::Path,
    url::Url,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub base_url: Option<Url>,
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default)]
    pub checksum: bool,
    #[serde(default)]
    pub max_days: Option<u32>,
    #[serde(default)]
    pub max_downloads: Option<u32>,
    /// Password for encryption and decryption. If encryption is enabled and
    /// no password is configured, it's prompted for interactively.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_true() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            compress: true,
            encrypt: true,
            checksum: false,
            max_days: None,
            max_downloads: None,
            password: None,
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Loads the config from `path` if given, otherwise from
    /// `{config_dir}/kasta.json5`. A missing default config file is not an
    /// error; an explicitly specified one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let Some(config_dir) = dirs::config_dir() else {
                    return Ok(Self::default());
                };
                let path = config_dir.join("kasta.json5");
                if !path.try_exists()? {
                    return Ok(Self::default());
                }
                path
            }
        };
        let text = fs_err::read_to_string(&path)?;
        json5::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
    }
}
