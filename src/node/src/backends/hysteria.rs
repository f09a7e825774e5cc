// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Hysteria back-end flavor.

use std::path::PathBuf;

use warden_service::types::{BackendType, ConfigFormat, Inbound};

use super::BackendSpec;

const DEFAULT_TAG: &str = "hysteria";

pub fn spec(executable: PathBuf, config_path: PathBuf) -> BackendSpec {
    let launch_args = vec![
        "server".to_owned(),
        "-c".to_owned(),
        config_path.display().to_string(),
    ];
    BackendSpec {
        backend_type: BackendType::Hysteria,
        config_format: ConfigFormat::Yaml,
        executable,
        config_path,
        launch_args,
        version_args: vec!["version".to_owned()],
    }
}

/// A hysteria server exposes a single listener. The YAML configuration has
/// no inbound array; an explicit top-level `tag:` line overrides the default
/// tag.
pub fn parse_inbounds(config: &str) -> Vec<Inbound> {
    let tag = config
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("tag:"))
        .map(|rest| rest.trim().trim_matches('"').to_owned())
        .filter(|tag| !tag.is_empty())
        .unwrap_or_else(|| DEFAULT_TAG.to_owned());
    vec![Inbound {
        tag,
        config: "{}".to_owned(),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tag_when_unspecified() {
        let inbounds = parse_inbounds("listen: :443\nauth:\n  type: password\n");
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0].tag, "hysteria");
    }

    #[test]
    fn explicit_tag_wins() {
        let inbounds = parse_inbounds("tag: hy2-main\nlisten: :443\n");
        assert_eq!(inbounds[0].tag, "hy2-main");
    }
}
