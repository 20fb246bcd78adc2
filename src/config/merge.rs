use super::{Config, ConfigLayer};

pub fn merge_layers(user: Option<ConfigLayer>, explicit: Option<ConfigLayer>) -> Config {
    let mut config = Config::default();
    if let Some(layer) = user {
        layer.apply_to(&mut config);
    }
    if let Some(layer) = explicit {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let value = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };
    let millis = |key: &str| {
        let raw = value(key)?;
        match raw.parse::<u64>() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("invalid {key}, ignoring: {err}");
                None
            }
        }
    };

    if let Some(addr) = value("QCOLLAB_LISTEN_ADDR") {
        config.collab.listen_addr = addr;
    }

    if let Some(addr) = value("QCOLLAB_ADVERTISE_ADDR") {
        config.collab.advertise_addr = Some(addr);
    }

    if let Some(raw) = value("QCOLLAB_PEERS") {
        config.collab.peers = raw
            .split(',')
            .map(str::trim)
            .filter(|peer| !peer.is_empty())
            .map(str::to_string)
            .collect();
    }

    if let Some(ms) = millis("QCOLLAB_CHECK_INTERVAL_MS") {
        config.collab.check_interval_ms = ms;
    }

    if let Some(ms) = millis("QCOLLAB_STATUS_INTERVAL_MS") {
        config.collab.status_interval_ms = ms;
    }
}
