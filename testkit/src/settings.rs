use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Knobs shared by every REST collaborator in the harness.
/// Built once by the caller and passed down explicitly.
#[derive(Envconfig, Clone, Debug)]
pub struct Settings {
    #[envconfig(default = "30000")]
    pub http_request_timeout: EnvMsDuration,

    #[envconfig(default = "10")]
    pub max_request_workers: usize,

    #[envconfig(default = "4985")]
    pub admin_port: u16,

    #[envconfig(default = "4984")]
    pub public_port: u16,

    #[envconfig(default = "Administrator")]
    pub server_admin_user: String,

    #[envconfig(default = "password")]
    pub server_admin_password: String,

    #[envconfig(default = "60000")]
    pub server_ready_timeout: EnvMsDuration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_request_timeout: EnvMsDuration(time::Duration::from_secs(30)),
            max_request_workers: 10,
            admin_port: 4985,
            public_port: 4984,
            server_admin_user: "Administrator".to_owned(),
            server_admin_password: "password".to_owned(),
            server_ready_timeout: EnvMsDuration(time::Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
