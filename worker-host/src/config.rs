use crate::registry::LaunchCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env(value: &str) -> anyhow::Result<Self> {
        match value {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!(
                "Invalid LOG_FORMAT '{other}'. Expected 'text' or 'json'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the UI transport binds to
    pub bind: String,
    /// Port the UI transport listens on
    pub port: u16,
    /// How to start a model worker
    pub model_runner: LaunchCommand,
    /// How to start a param-finder worker
    pub param_finder: LaunchCommand,
    /// Fixed model pool size; computed from the host when unset
    pub max_concurrent_models: Option<usize>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let vars = Vars(&lookup);
        Ok(Self {
            bind: vars.str("WORKER_HOST_BIND", "127.0.0.1"),
            port: vars.parse("WORKER_HOST_PORT", 9191)?,
            model_runner: LaunchCommand::new(vars.str("MODEL_RUNNER", "model-runner"))
                .with_args(vars.csv("MODEL_RUNNER_ARGS")),
            param_finder: LaunchCommand::new(vars.str("PARAM_FINDER", "param-finder"))
                .with_args(vars.csv("PARAM_FINDER_ARGS")),
            max_concurrent_models: vars.parse_opt("MAX_CONCURRENT_MODELS")?,
            log_format: LogFormat::from_env(&vars.str("LOG_FORMAT", "text"))?,
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn str(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T::Err: std::fmt::Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn parse_opt<T: std::str::FromStr>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            Some(val) if !val.trim().is_empty() => val
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
            _ => Ok(None),
        }
    }

    fn csv(&self, key: &str) -> Vec<String> {
        match (self.0)(key) {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => Vec::new(),
        }
    }
}
