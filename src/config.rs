use crate::exec::PollConfig;
use crate::gci::LoginParams;
use crate::{muted_error, weak_error};
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

/// Login section of the configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoginConfig {
    /// Stone address (NRS), like `!tcp@localhost#server!gs64stone`.
    pub stone: String,
    /// Gem service address (NRS), like `!tcp@localhost#netldi:gs64ldi#task!gemnetobject`.
    pub gem: String,
    pub username: String,
    pub password: String,
    pub host_username: Option<String>,
    pub host_password: Option<String>,
}

impl LoginConfig {
    /// Values of `other` that are set replace values of `self`.
    pub fn merge(mut self, other: LoginConfig) -> Self {
        fn pick(dst: &mut String, src: String) {
            if !src.is_empty() {
                *dst = src;
            }
        }
        pick(&mut self.stone, other.stone);
        pick(&mut self.gem, other.gem);
        pick(&mut self.username, other.username);
        pick(&mut self.password, other.password);
        if other.host_username.is_some() {
            self.host_username = other.host_username;
        }
        if other.host_password.is_some() {
            self.host_password = other.host_password;
        }
        self
    }

    pub fn to_params(&self) -> LoginParams {
        LoginParams {
            stone: self.stone.clone(),
            gem: self.gem.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            host_username: self.host_username.clone(),
            host_password: self.host_password.clone(),
            login_flags: 0,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub login: LoginConfig,
    /// Path to the thread-safe GCI library.
    pub library: Option<PathBuf>,
    pub poll: PollConfig,
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/gemstalker/config.toml";

    /// Load configuration from file. Return [`None`] on errors.
    ///
    /// Without an explicit path the default file in the home directory is used,
    /// a missing default file is not an error worth logging.
    pub fn from_file(path: Option<&Path>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?;
                let path = path.join(Self::DEFAULT_PATH);
                muted_error!(read_to_string(path))?
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    log::error!("Error while load config file {}: {err}", path.display());
                    return None;
                }
            },
        };

        weak_error!(Self::from_toml(&data))
    }

    pub fn from_toml(data: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(data)
    }
}
