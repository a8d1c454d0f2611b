// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fs;

use signer_protocol::TokenType;
use signer_server::Config;
use tracing_test::traced_test;

const CONFIG: &str = r#"
address = "127.0.0.1:0"

[[tokens]]
id = "0"
type = "SOFTWARE"
pin_file = "pins/0"

[[tokens]]
id = "slot-7"
type = "HARDWARE_SLOT"
read_only = true
pin_file = "pins/missing"

[[tokens]]
id = "0"
type = "HARDWARE_SLOT"
"#;

#[tokio::test]
#[traced_test]
async fn loads_tokens_with_pins_next_to_the_config() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("pins")).unwrap();
    fs::write(dir.path().join("pins/0"), "1234\n").unwrap();
    let path = dir.path().join("signer.toml");
    fs::write(&path, CONFIG).unwrap();

    let (config, hash) = Config::load(&path).await.unwrap();
    assert_eq!(config.tokens[0].pin_file, Some(dir.path().join("pins/0")));

    let specs = config.token_specs().await;
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].id, "0");
    assert_eq!(specs[0].token_type, TokenType::Software);
    assert_eq!(specs[0].friendly_name, "softToken-0");
    assert_eq!(specs[0].pin.as_ref().map(|p| p.expose()), Some("1234"));

    assert_eq!(specs[1].id, "slot-7");
    assert_eq!(specs[1].friendly_name, "slot-slot-7");
    assert!(specs[1].read_only);
    assert!(specs[1].pin.is_none());
    assert!(logs_contain("Token slot-7 will start logged out"));
    assert!(logs_contain("Ignoring duplicate config entry for token 0"));

    let (_, same_hash) = Config::load(&path).await.unwrap();
    assert_eq!(hash, same_hash);
    fs::write(&path, format!("{CONFIG}\n# edited\n")).unwrap();
    let (_, new_hash) = Config::load(&path).await.unwrap();
    assert_ne!(hash, new_hash);
}

#[tokio::test]
async fn load_reports_what_went_wrong() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("signer.toml");

    let err = Config::load(&path).await.unwrap_err();
    assert!(format!("{err:#}").contains("Couldn't open config TOML"), "{err:#}");

    fs::write(&path, "max_connections = \"lots\"").unwrap();
    let err = Config::load(&path).await.unwrap_err();
    assert!(format!("{err:#}").contains("Couldn't parse config TOML"), "{err:#}");
}
