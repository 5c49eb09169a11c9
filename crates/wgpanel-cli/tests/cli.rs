use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;
use wgpanel_cli::commands::{self, CommandError, ExportArgs, ReapplyArgs};
use wgpanel_cli::settings::Settings;
use wgpanel_core::export::{ExportError, ExportField};
use wgpanel_core::keys::{KeyError, KeyPair, KeyPairProvider};
use wgpanel_core::store::{ConfigStore, StoreError};
use wgpanel_core::QrPngEncoder;

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];

// -- Mock key provider --

#[derive(Default)]
struct SequenceKeys {
    next: AtomicU32,
}

impl KeyPairProvider for SequenceKeys {
    fn generate(&self) -> Result<KeyPair, KeyError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let mut secret = [0u8; 32];
        secret[1..5].copy_from_slice(&n.to_le_bytes());
        Ok(KeyPair::from_secret_bytes(secret))
    }
}

// -- Helpers --

struct Panel {
    store: ConfigStore,
    settings: Settings,
    keys: SequenceKeys,
}

impl Panel {
    async fn generated(dir: &Path) -> Self {
        let settings = Settings {
            document: dir.join("wg0.conf"),
            ..Settings::default()
        };
        let store = ConfigStore::open(&settings.document).await.unwrap();
        let keys = SequenceKeys::default();
        let mut out = Vec::new();
        commands::generate(&store, &settings, &keys, false, &mut out)
            .await
            .unwrap();
        Self {
            store,
            settings,
            keys,
        }
    }

    async fn add(&self) -> String {
        let mut out = Vec::new();
        commands::add_peer(&self.store, &self.keys, &mut out)
            .await
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    async fn export_json(&self, args: ExportArgs<'_>) -> Value {
        let mut out = Vec::new();
        commands::export(
            &self.store,
            &self.settings,
            &QrPngEncoder::default(),
            ExportArgs { json: true, ..args },
            &mut out,
        )
        .await
        .unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    fn peers_json(&self) -> Value {
        let mut out = Vec::new();
        commands::peers(&self.store, true, &mut out).unwrap();
        serde_json::from_slice(&out).unwrap()
    }
}

// -- Tests --

#[tokio::test]
async fn commands_require_a_generated_document() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path().join("wg0.conf")).await.unwrap();
    let mut out = Vec::new();

    assert!(matches!(
        commands::show(&store, &mut out),
        Err(CommandError::NotGenerated(_))
    ));
    assert!(matches!(
        commands::peers(&store, false, &mut out),
        Err(CommandError::NotGenerated(_))
    ));
    assert!(matches!(
        commands::add_peer(&store, &SequenceKeys::default(), &mut out).await,
        Err(CommandError::Store(StoreError::NotGenerated))
    ));
}

#[tokio::test]
async fn generate_then_show() {
    let dir = tempfile::tempdir().unwrap();
    let panel = Panel::generated(dir.path()).await;

    let mut out = Vec::new();
    commands::show(&panel.store, &mut out).unwrap();
    let shown = String::from_utf8(out).unwrap();
    assert!(shown.starts_with("[Interface]\n"));
    assert!(shown.contains("Address = 11.0.0.1/24\n"));
    assert!(shown.contains("ListenPort = 51820\n"));
    assert_eq!(shown, std::fs::read_to_string(panel.store.path()).unwrap());

    let mut out = Vec::new();
    let err = commands::generate(&panel.store, &panel.settings, &panel.keys, false, &mut out)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Store(StoreError::AlreadyGenerated(_))
    ));

    commands::generate(&panel.store, &panel.settings, &panel.keys, true, &mut out)
        .await
        .unwrap();
}

#[tokio::test]
async fn generate_uses_interface_settings() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings {
        document: dir.path().join("wg0.conf"),
        ..Settings::default()
    };
    settings.interface.address = "10.8.0.1/24".into();
    settings.interface.listen_port = 51999;
    settings.interface.uplink = "ens3".into();

    let store = ConfigStore::open(&settings.document).await.unwrap();
    let mut out = Vec::new();
    commands::generate(&store, &settings, &SequenceKeys::default(), false, &mut out)
        .await
        .unwrap();

    let summary = String::from_utf8(out).unwrap();
    assert!(summary.contains("Address: 10.8.0.1/24\n"));
    assert!(summary.contains("ListenPort: 51999\n"));
    let on_disk = std::fs::read_to_string(&settings.document).unwrap();
    assert!(on_disk.contains("-o ens3 -j MASQUERADE"));
}

#[tokio::test]
async fn add_list_and_remove_peers() {
    let dir = tempfile::tempdir().unwrap();
    let panel = Panel::generated(dir.path()).await;

    assert!(panel.add().await.starts_with("Added Peer1 11.0.0.2/32 "));
    assert!(panel.add().await.starts_with("Added Peer2 11.0.0.3/32 "));

    let listed = panel.peers_json();
    assert_eq!(listed.as_array().unwrap().len(), 2);
    assert_eq!(listed[1]["name"], "Peer2");
    assert_eq!(listed[1]["allowed_ips"], "11.0.0.3/32");
    let second_key = listed[1]["public_key"].as_str().unwrap().to_string();

    let mut out = Vec::new();
    commands::remove_peer(&panel.store, "Peer1", &mut out)
        .await
        .unwrap();

    let listed = panel.peers_json();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["name"], "Peer1");
    assert_eq!(listed[0]["public_key"], second_key.as_str());

    let mut out = Vec::new();
    commands::peers(&panel.store, false, &mut out).unwrap();
    let table = String::from_utf8(out).unwrap();
    assert_eq!(table, format!("Peer1\t11.0.0.3/32\t{second_key}\n"));
}

#[tokio::test]
async fn removing_unknown_peer_fails() {
    let dir = tempfile::tempdir().unwrap();
    let panel = Panel::generated(dir.path()).await;
    panel.add().await;
    let before = std::fs::read_to_string(panel.store.path()).unwrap();

    let mut out = Vec::new();
    let err = commands::remove_peer(&panel.store, "Peer7", &mut out)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::UnknownPeer(ref p) if p == "Peer7"));
    assert_eq!(std::fs::read_to_string(panel.store.path()).unwrap(), before);
}

#[tokio::test]
async fn export_with_defaults_and_png() {
    let dir = tempfile::tempdir().unwrap();
    let panel = Panel::generated(dir.path()).await;
    panel.add().await;
    let png = dir.path().join("peer1.png");

    let exported = panel
        .export_json(ExportArgs {
            peer: "Peer1",
            png: Some(png.as_path()),
            ..ExportArgs::default()
        })
        .await;

    let config = exported["peer_config"].as_str().unwrap();
    assert!(config.contains("Address = 11.0.0.2/32\n"));
    assert!(config.contains("DNS = 1.1.1.1\n"));
    assert!(config.contains("Endpoint = 11.0.0.1:51820\n"));
    assert!(config.contains("AllowedIPs = 0.0.0.0/0\n"));
    assert!(!exported["qr_code"].as_str().unwrap().is_empty());
    assert!(std::fs::read(&png).unwrap().starts_with(PNG_MAGIC));
}

#[tokio::test]
async fn export_prefers_flags_over_settings() {
    let dir = tempfile::tempdir().unwrap();
    let mut panel = Panel::generated(dir.path()).await;
    panel.add().await;
    panel.settings.export.dns = "8.8.8.8".into();
    panel.settings.export.endpoint = Some("vpn.example.com:51820".into());

    let exported = panel
        .export_json(ExportArgs {
            peer: "Peer1",
            ..ExportArgs::default()
        })
        .await;
    let config = exported["peer_config"].as_str().unwrap();
    assert!(config.contains("DNS = 8.8.8.8\n"));
    assert!(config.contains("Endpoint = vpn.example.com:51820\n"));

    let exported = panel
        .export_json(ExportArgs {
            peer: "Peer1",
            dns: Some("9.9.9.9".into()),
            ..ExportArgs::default()
        })
        .await;
    let config = exported["peer_config"].as_str().unwrap();
    assert!(config.contains("DNS = 9.9.9.9\n"));
    assert!(config.contains("Endpoint = vpn.example.com:51820\n"));
}

#[tokio::test]
async fn export_prints_text_and_terminal_qr() {
    let dir = tempfile::tempdir().unwrap();
    let panel = Panel::generated(dir.path()).await;
    panel.add().await;

    let mut out = Vec::new();
    commands::export(
        &panel.store,
        &panel.settings,
        &QrPngEncoder::default(),
        ExportArgs {
            peer: "Peer1",
            qr: true,
            ..ExportArgs::default()
        },
        &mut out,
    )
    .await
    .unwrap();

    let printed = String::from_utf8(out).unwrap();
    assert!(printed.starts_with("[Interface]\n"));
    assert!(printed.contains("PersistentKeepalive = 25\n\n"));
    assert!(printed.lines().count() > 20);
}

#[tokio::test]
async fn plain_export_output_feeds_reapply() {
    let dir = tempfile::tempdir().unwrap();
    let panel = Panel::generated(dir.path()).await;
    panel.add().await;

    let mut exported = Vec::new();
    commands::export(
        &panel.store,
        &panel.settings,
        &QrPngEncoder::default(),
        ExportArgs {
            peer: "Peer1",
            ..ExportArgs::default()
        },
        &mut exported,
    )
    .await
    .unwrap();
    let exported = String::from_utf8(exported).unwrap();
    assert!(exported.ends_with("PersistentKeepalive = 25\n"));

    let mut out = Vec::new();
    commands::reapply(
        &QrPngEncoder::default(),
        ReapplyArgs {
            text: &exported,
            field: ExportField::Dns,
            value: "9.9.9.9",
            png: None,
            json: false,
            qr: false,
        },
        &mut out,
    )
    .await
    .unwrap();

    let reapplied = String::from_utf8(out).unwrap();
    assert_eq!(reapplied, exported.replace("DNS = 1.1.1.1", "DNS = 9.9.9.9"));
}

#[tokio::test]
async fn export_unknown_peer() {
    let dir = tempfile::tempdir().unwrap();
    let panel = Panel::generated(dir.path()).await;

    let mut out = Vec::new();
    let err = commands::export(
        &panel.store,
        &panel.settings,
        &QrPngEncoder::default(),
        ExportArgs {
            peer: "Peer1",
            ..ExportArgs::default()
        },
        &mut out,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CommandError::UnknownPeer(_)));
    assert!(out.is_empty());
}

#[tokio::test]
async fn reapply_rewrites_exported_text() {
    let dir = tempfile::tempdir().unwrap();
    let panel = Panel::generated(dir.path()).await;
    panel.add().await;
    let exported = panel
        .export_json(ExportArgs {
            peer: "Peer1",
            ..ExportArgs::default()
        })
        .await;
    let text = exported["peer_config"].as_str().unwrap();
    let before = std::fs::read_to_string(panel.store.path()).unwrap();

    let mut out = Vec::new();
    commands::reapply(
        &QrPngEncoder::default(),
        ReapplyArgs {
            text,
            field: "endpoint".parse().unwrap(),
            value: "vpn.example.com:443",
            png: None,
            json: true,
            qr: false,
        },
        &mut out,
    )
    .await
    .unwrap();

    let reapplied: Value = serde_json::from_slice(&out).unwrap();
    let config = reapplied["peer_config"].as_str().unwrap();
    assert_eq!(
        config,
        text.replace("Endpoint = 11.0.0.1:51820", "Endpoint = vpn.example.com:443")
    );
    assert_ne!(reapplied["qr_code"], exported["qr_code"]);
    assert_eq!(std::fs::read_to_string(panel.store.path()).unwrap(), before);
}

#[tokio::test]
async fn reapply_requires_the_field() {
    let mut out = Vec::new();
    let err = commands::reapply(
        &QrPngEncoder::default(),
        ReapplyArgs {
            text: "[Interface]\nAddress = 11.0.0.2/32\n",
            field: ExportField::Dns,
            value: "9.9.9.9",
            png: None,
            json: false,
            qr: false,
        },
        &mut out,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        CommandError::Export(ExportError::FieldNotPresent(ExportField::Dns))
    ));
}
