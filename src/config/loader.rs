use super::schema::{Config, CounterBackend};
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Format, Json, Serialized, Toml, Yaml},
    value::Value,
    Figment,
};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const ENV_PREFIX: &str = "PLUGIN_PROXY_";

pub fn load_from_env_or_file() -> Result<Config> {
    let figment = defaults()
        .merge(Toml::file("plugin-proxy.toml"))
        .merge(Json::file("plugin-proxy.json"))
        .merge(Yaml::file("plugin-proxy.yaml"))
        .merge(Yaml::file("plugin-proxy.yml"));

    finish(figment)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => defaults().merge(Toml::file(path)),
        Some("json") => defaults().merge(Json::file(path)),
        Some("yaml") | Some("yml") => defaults().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    finish(figment)
}

fn defaults() -> Figment {
    Figment::from(Serialized::defaults(Config::default()))
}

/// Layers environment overrides on top of file sources, then substitutes and validates.
fn finish(figment: Figment) -> Result<Config> {
    let config: Config = with_prefixed_env(with_compat_env(figment)?)
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

/// Plain variables understood by earlier deployments of the service.
fn with_compat_env(mut figment: Figment) -> Result<Figment> {
    if let Some(port) = env_var("PORT") {
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::EnvVar(format!("PORT is not a valid port: {}", port)))?;
        figment = figment.merge(Serialized::default("server.port", port));
    }

    if let Some(interval) = env_var("UPDATE_INTERVAL_SEC") {
        let interval: u64 = interval.parse().map_err(|_| {
            ConfigError::EnvVar(format!("UPDATE_INTERVAL_SEC is not a number: {}", interval))
        })?;
        figment = figment.merge(Serialized::default(
            "registry.refreshIntervalSeconds",
            interval,
        ));
    }

    if let Some(app) = env_var("HEROKU_APP_NAME") {
        figment = figment.merge(Serialized::default(
            "server.baseAddress",
            format!("https://{}.herokuapp.com", app),
        ));
    }

    if let Some(url) = env_var("APP_URL") {
        figment = figment.merge(Serialized::default("server.baseAddress", url));
    }

    if let Some(key) = env_var("IMPORT_KEY") {
        figment = figment.merge(Serialized::default("import.key", key));
    }

    Ok(figment)
}

/// `PLUGIN_PROXY_PROXY__ASSET_DELAY_MS=0` sets `proxy.assetDelayMs`.
fn with_prefixed_env(mut figment: Figment) -> Figment {
    let mut vars: Vec<(String, String)> = std::env::vars()
        .filter_map(|(name, value)| {
            let path = name.strip_prefix(ENV_PREFIX)?;
            Some((env_key_path(path)?, value))
        })
        .collect();
    vars.sort();

    for (path, value) in vars {
        let value: Value = value
            .parse()
            .unwrap_or_else(|never: std::convert::Infallible| match never {});
        figment = figment.merge(Serialized::default(&path, value));
    }
    figment
}

fn env_key_path(name: &str) -> Option<String> {
    let segments = name
        .split("__")
        .map(camel_case)
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("."))
}

fn camel_case(segment: &str) -> Option<String> {
    let mut words = segment.split('_').filter(|word| !word.is_empty());
    let mut key = words.next()?.to_ascii_lowercase();
    for word in words {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            key.push(first.to_ascii_uppercase());
            key.push_str(&chars.as_str().to_ascii_lowercase());
        }
    }
    Some(key)
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        return Err(ConfigError::Validation("Server port must be greater than 0".into()).into());
    }

    // A refresh interval of 0 is valid: every list request refreshes the cache.

    if config.proxy.max_tap_bytes == 0 {
        return Err(
            ConfigError::Validation("Proxy maxTapBytes must be greater than 0".into()).into(),
        );
    }

    if config.proxy.max_request_bytes == 0 {
        return Err(
            ConfigError::Validation("Proxy maxRequestBytes must be greater than 0".into()).into(),
        );
    }

    let base_address = config.server.base_address();
    match url::Url::parse(&base_address) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
        Ok(_) => {
            return Err(ConfigError::Validation(format!(
                "Base address '{}' must be an http(s) URL",
                base_address
            ))
            .into())
        }
        Err(e) => {
            return Err(ConfigError::Validation(format!(
                "Base address '{}' is invalid: {}",
                base_address, e
            ))
            .into())
        }
    }

    if config.counters.backend == CounterBackend::Sqlite
        && config.counters.sqlite_path.as_os_str().is_empty()
    {
        return Err(ConfigError::Validation(
            "SQLite counter backend needs a sqlitePath".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    if let Some(base_address) = &mut config.server.base_address {
        *base_address = substitute_env_vars(base_address)?;
    }

    config.registry.path = substitute_path(&config.registry.path)?;
    config.counters.sqlite_path = substitute_path(&config.counters.sqlite_path)?;

    if let Some(key) = &mut config.import.key {
        *key = substitute_env_vars(key)?;
    }

    Ok(config)
}

fn substitute_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(substitute_env_vars(&path.to_string_lossy())?))
}

fn substitute_env_vars(input: &str) -> Result<String> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"\$\{([^}]+)\}").expect("substitution pattern is valid")
    });

    let mut result = input.to_string();
    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let value = match var_name.split_once(":-") {
            Some((name, default)) => {
                std::env::var(name).unwrap_or_else(|_| default.to_string())
            }
            None => std::env::var(var_name).map_err(|_| {
                ConfigError::EnvVar(format!("Environment variable '{}' not found", var_name))
            })?,
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use crate::error::ProxyError;
    use figment::Jail;

    #[test]
    fn test_defaults_without_sources() {
        Jail::expect_with(|_jail| {
            let config = load_from_env_or_file().unwrap();
            assert_eq!(config.server.port, 5002);
            assert_eq!(config.server.host, "0.0.0.0");
            assert_eq!(config.server.base_address(), "http://localhost:5002");
            assert_eq!(config.registry.refresh_interval_seconds, 100);
            assert_eq!(config.proxy.asset_delay_ms, 2000);
            assert_eq!(config.counters.backend, CounterBackend::Memory);
            assert_eq!(config.import.key, None);
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_with_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "plugin-proxy.toml",
                r#"
                [server]
                port = 8080
                baseAddress = "https://plugins.example.com"

                [registry]
                path = "data/registry.json"
                refreshIntervalSeconds = 30

                [counters]
                backend = "sqlite"
                sqlitePath = "/var/lib/proxy/installs.db"

                [logging]
                format = "json"
                "#,
            )?;
            jail.set_env("PLUGIN_PROXY_SERVER__PORT", "9090");
            jail.set_env("PLUGIN_PROXY_PROXY__ASSET_DELAY_MS", "0");

            let config = load_from_env_or_file().unwrap();
            assert_eq!(config.server.port, 9090);
            assert_eq!(config.server.base_address(), "https://plugins.example.com");
            assert_eq!(config.registry.path, PathBuf::from("data/registry.json"));
            assert_eq!(config.registry.refresh_interval_seconds, 30);
            assert_eq!(config.proxy.asset_delay_ms, 0);
            assert_eq!(config.counters.backend, CounterBackend::Sqlite);
            assert_eq!(config.logging.format, LogFormat::Json);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_path() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "custom.yaml",
                "proxy:\n  maxTapBytes: 4096\nimport:\n  key: secret\n",
            )?;

            let config = load_from_path("custom.yaml").unwrap();
            assert_eq!(config.proxy.max_tap_bytes, 4096);
            assert_eq!(config.import.key.as_deref(), Some("secret"));
            Ok(())
        });
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(matches!(
            load_from_path("config.ini"),
            Err(ProxyError::Config(ConfigError::Parse(_)))
        ));
    }

    #[test]
    fn test_compat_env_vars() {
        Jail::expect_with(|jail| {
            jail.set_env("PORT", "7000");
            jail.set_env("UPDATE_INTERVAL_SEC", "15");
            jail.set_env("HEROKU_APP_NAME", "hunterpie-plugins");
            jail.set_env("IMPORT_KEY", "letmein");

            let config = load_from_env_or_file().unwrap();
            assert_eq!(config.server.port, 7000);
            assert_eq!(config.registry.refresh_interval_seconds, 15);
            assert_eq!(
                config.server.base_address(),
                "https://hunterpie-plugins.herokuapp.com"
            );
            assert_eq!(config.import.key.as_deref(), Some("letmein"));

            jail.set_env("UPDATE_INTERVAL_SEC", "0");
            let config = load_from_env_or_file().unwrap();
            assert_eq!(config.registry.refresh_interval_seconds, 0);
            assert!(validate(&config).is_ok());

            jail.set_env("APP_URL", "https://proxy.internal");
            let config = load_from_env_or_file().unwrap();
            assert_eq!(config.server.base_address(), "https://proxy.internal");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_compat_port() {
        Jail::expect_with(|jail| {
            jail.set_env("PORT", "eighty");
            assert!(matches!(
                load_from_env_or_file(),
                Err(ProxyError::Config(ConfigError::EnvVar(_)))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_env_key_path() {
        assert_eq!(env_key_path("SERVER__PORT").as_deref(), Some("server.port"));
        assert_eq!(
            env_key_path("REGISTRY__REFRESH_INTERVAL_SECONDS").as_deref(),
            Some("registry.refreshIntervalSeconds")
        );
        assert_eq!(env_key_path("SERVER__"), None);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(validate(&config).is_ok());

        config.registry.refresh_interval_seconds = 0;
        assert!(validate(&config).is_ok());

        config.proxy.max_request_bytes = 0;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.server.base_address = Some("ftp://files.example.com".into());
        assert!(validate(&config).is_err());

        config.server.base_address = Some("not a url".into());
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.counters.backend = CounterBackend::Sqlite;
        config.counters.sqlite_path = PathBuf::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_env_substitution() {
        Jail::expect_with(|jail| {
            jail.set_env("PROXY_TEST_HOST", "plugins.example.com");

            let result = substitute_env_vars("https://${PROXY_TEST_HOST}/").unwrap();
            assert_eq!(result, "https://plugins.example.com/");

            let result = substitute_env_vars("${PROXY_TEST_MISSING:-installs.db}").unwrap();
            assert_eq!(result, "installs.db");

            assert!(substitute_env_vars("${PROXY_TEST_MISSING}").is_err());
            Ok(())
        });
    }
}
