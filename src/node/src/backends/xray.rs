// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Xray back-end flavor.

use std::path::PathBuf;

use warden_service::types::{BackendType, ConfigFormat, Inbound};

use super::BackendSpec;

pub fn spec(executable: PathBuf, config_path: PathBuf) -> BackendSpec {
    let launch_args = vec![
        "run".to_owned(),
        "-c".to_owned(),
        config_path.display().to_string(),
    ];
    BackendSpec {
        backend_type: BackendType::Xray,
        config_format: ConfigFormat::Json,
        executable,
        config_path,
        launch_args,
        version_args: vec!["version".to_owned()],
    }
}

/// Extracts the tagged inbounds from an Xray JSON configuration. Untagged
/// inbounds cannot be addressed by the panel and are skipped.
pub fn parse_inbounds(config: &str) -> Vec<Inbound> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(config) else {
        return Vec::new();
    };
    let Some(inbounds) = value.get("inbounds").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    inbounds
        .iter()
        .filter_map(|inbound| {
            let tag = inbound.get("tag")?.as_str()?.to_owned();
            Some(Inbound {
                tag,
                config: inbound.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_inbounds() {
        let config = r#"{
            "inbounds": [
                {"tag": "vless-tcp", "protocol": "vless", "port": 443},
                {"protocol": "vmess", "port": 8080},
                {"tag": "vmess-ws", "protocol": "vmess", "port": 8443}
            ],
            "outbounds": []
        }"#;
        let inbounds = parse_inbounds(config);
        let tags: Vec<_> = inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["vless-tcp", "vmess-ws"]);
        assert!(inbounds[0].config.contains("\"port\":443"));
    }

    #[test]
    fn tolerates_malformed_config() {
        assert!(parse_inbounds("not json").is_empty());
        assert!(parse_inbounds("{}").is_empty());
    }
}
