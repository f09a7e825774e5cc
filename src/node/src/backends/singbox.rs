// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! sing-box back-end flavor.

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
        backend_type: BackendType::SingBox,
        config_format: ConfigFormat::Json,
        executable,
        config_path,
        launch_args,
        version_args: vec!["version".to_owned()],
    }
}

/// sing-box configurations use the same `inbounds[].tag` layout as Xray.
pub fn parse_inbounds(config: &str) -> Vec<Inbound> {
    super::xray::parse_inbounds(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_singbox_inbounds() {
        let config = r#"{
            "inbounds": [
                {"tag": "ss-in", "type": "shadowsocks", "listen_port": 8388}
            ]
        }"#;
        let inbounds = parse_inbounds(config);
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0].tag, "ss-in");
    }
}
