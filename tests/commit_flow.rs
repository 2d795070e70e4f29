//! Committing overlay edits to a simulated radio: acknowledgement, rejection, timeout,
//! link loss, group independence and read-back.

mod common;

use std::time::Duration;

use common::{fast_settings, wait_until, FakeRadio, Policy, Reply};
use meshsync::bulk::BulkConfigDocument;
use meshsync::connection::{ConnectionHandle, ConnectionManager, ManagerEvent, SessionSettings};
use meshsync::device::sections::{ConfigGroup, SectionKey};
use meshsync::errors::CommitError;
use meshsync::overlay::EditValue;
use meshsync::protobuf::meshtastic::admin_message::PayloadVariant as AdminPayload;
use meshsync::protobuf::meshtastic::config;
use serde_json::json;

fn key(name: &str) -> SectionKey {
    name.parse().expect("section")
}

fn lora_of(manager: &ConnectionManager, h: &ConnectionHandle) -> config::LoRaConfig {
    manager
        .get_snapshot(h)
        .lora()
        .cloned()
        .expect("lora reported")
}

#[tokio::test]
async fn lora_scenario_commits_merged_record() {
    let manager = ConnectionManager::new(fast_settings());
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT0", Policy::default()).await;
    let h = &radio.handle;

    manager
        .edit_field(h, key("lora"), "txPower", EditValue::Set(json!(20)))
        .await
        .unwrap();
    assert_eq!(manager.get_pending_changes(h, key("lora")), 1);
    assert_eq!(manager.get_edits(h, key("lora")), Some(json!({ "txPower": 20 })));

    let report = manager.commit(h, &[ConfigGroup::Radio]).await.unwrap();
    assert!(report.is_success(), "{:?}", report);

    // Edit transaction wraps the single full-record write
    let admin = radio.admin_log();
    assert!(matches!(admin[0].payload_variant, Some(AdminPayload::BeginEditSettings(true))));
    match &admin[1].payload_variant {
        Some(AdminPayload::SetConfig(cfg)) => match &cfg.payload_variant {
            Some(config::PayloadVariant::Lora(l)) => {
                assert_eq!(l.tx_power, 20);
                assert_eq!(l.bandwidth, 250);
                assert_eq!(l.region, 1);
            }
            other => panic!("unexpected config {:?}", other),
        },
        other => panic!("unexpected admin {:?}", other),
    }
    assert!(matches!(admin[2].payload_variant, Some(AdminPayload::CommitEditSettings(true))));

    // Overlay cleared, store refreshed from the device's read-back
    assert_eq!(manager.get_edits(h, key("lora")), None);
    assert!(wait_until(Duration::from_secs(2), || lora_of(&manager, h).tx_power == 20).await);
    assert_eq!(manager.get_pending_changes(h, key("lora")), 0);
}

#[tokio::test]
async fn store_follows_device_echo_not_local_merge() {
    let manager = ConnectionManager::new(fast_settings());
    let radio = FakeRadio::connected(
        &manager,
        "/dev/ttyCOMMIT1",
        Policy {
            max_tx_power: Some(30),
            ..Policy::default()
        },
    )
    .await;
    let h = &radio.handle;

    manager
        .edit_field(h, key("lora"), "txPower", EditValue::Set(json!(40)))
        .await
        .unwrap();
    let report = manager.commit(h, &[ConfigGroup::Radio]).await.unwrap();
    assert!(report.is_success());
    assert!(wait_until(Duration::from_secs(2), || lora_of(&manager, h).tx_power == 30).await);
}

#[tokio::test]
async fn commit_without_active_connection_keeps_overlay() {
    let manager = ConnectionManager::new(fast_settings());
    // Radio never finishes the download, so the connection stays Pending
    let radio = FakeRadio::attach(
        &manager,
        "/dev/ttyCOMMIT2",
        Policy {
            answer_config: false,
            ..Policy::default()
        },
    )
    .await;
    let h = &radio.handle;
    manager
        .edit_field(h, key("channel/0"), "settings.name", EditValue::Set(json!("Ops")))
        .await
        .unwrap();
    let before = manager.get_edits(h, key("channel/0"));
    assert!(before.is_some());

    assert_eq!(
        manager.commit(h, &[ConfigGroup::Channel]).await,
        Err(CommitError::NoActiveConnection)
    );
    assert_eq!(manager.get_edits(h, key("channel/0")), before);
    assert!(radio.admin_log().is_empty());

    let gone = ConnectionHandle::from("/dev/ttyGONE");
    assert_eq!(
        manager.commit(&gone, &[ConfigGroup::Channel]).await,
        Err(CommitError::NoActiveConnection)
    );
}

#[tokio::test]
async fn ack_timeout_keeps_edits() {
    let manager = ConnectionManager::new(fast_settings());
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT3", Policy::default()).await;
    let h = &radio.handle;
    radio.set_policy(|p| p.reply = Reply::Ignore);

    manager
        .edit_field(h, key("lora"), "hopLimit", EditValue::Set(json!(6)))
        .await
        .unwrap();
    let report = manager.commit(h, &[ConfigGroup::Radio]).await.unwrap();
    assert_eq!(report.outcome(ConfigGroup::Radio), Some(&Err(CommitError::Timeout)));
    assert_eq!(manager.get_edits(h, key("lora")), Some(json!({ "hopLimit": 6 })));
    assert_eq!(manager.get_pending_changes(h, key("lora")), 1);
    assert_eq!(lora_of(&manager, h).hop_limit, 3);
}

#[tokio::test]
async fn nack_rejects_group_and_keeps_edits() {
    let manager = ConnectionManager::new(fast_settings());
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT4", Policy::default()).await;
    let h = &radio.handle;
    // NO_CHANNEL
    radio.set_policy(|p| p.reply = Reply::Nack(6));

    manager
        .edit_field(h, key("mqtt"), "enabled", EditValue::Set(json!(true)))
        .await
        .unwrap();
    let report = manager.commit(h, &[ConfigGroup::Module]).await.unwrap();
    match report.outcome(ConfigGroup::Module) {
        Some(Err(CommitError::Rejected(reason))) => assert_eq!(reason, "NO_CHANNEL"),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.failed_groups(), vec![ConfigGroup::Module]);
    assert_eq!(manager.get_pending_changes(h, key("mqtt")), 1);
}

#[tokio::test]
async fn groups_settle_independently() {
    let manager = ConnectionManager::new(fast_settings());
    let radio = FakeRadio::connected(
        &manager,
        "/dev/ttyCOMMIT5",
        Policy {
            channel_reply: Some(Reply::Nack(1)),
            ..Policy::default()
        },
    )
    .await;
    let h = &radio.handle;
    let mut events = manager.subscribe();

    manager
        .edit_field(h, key("lora"), "txPower", EditValue::Set(json!(12)))
        .await
        .unwrap();
    manager
        .edit_field(h, key("channel/0"), "settings.name", EditValue::Set(json!("Ops")))
        .await
        .unwrap();

    let report = manager
        .commit(h, &[ConfigGroup::Channel, ConfigGroup::Radio, ConfigGroup::Module])
        .await
        .unwrap();
    assert_eq!(report.outcome(ConfigGroup::Radio), Some(&Ok(())));
    // Nothing touched in the module group
    assert_eq!(report.outcome(ConfigGroup::Module), Some(&Ok(())));
    assert!(matches!(
        report.outcome(ConfigGroup::Channel),
        Some(Err(CommitError::Rejected(_)))
    ));

    assert_eq!(manager.get_edits(h, key("lora")), None);
    assert_eq!(
        manager.get_edits(h, key("channel/0")),
        Some(json!({ "settings": { "name": "Ops" } }))
    );
    let snap = manager.get_snapshot(h);
    assert_eq!(
        snap.channel(0).and_then(|c| c.settings.as_ref()).map(|s| s.name.clone()),
        Some("LongFast".to_string())
    );

    let finished = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, ManagerEvent::CommitFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn channel_commit_replaces_whole_slot() {
    let manager = ConnectionManager::new(fast_settings());
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT6", Policy::default()).await;
    let h = &radio.handle;

    manager
        .edit_field(h, key("channel/1"), "role", EditValue::Set(json!(2)))
        .await
        .unwrap();
    manager
        .edit_field(h, key("channel/1"), "settings.name", EditValue::Set(json!("Admin")))
        .await
        .unwrap();
    let report = manager.commit(h, &[ConfigGroup::Channel]).await.unwrap();
    assert!(report.is_success());

    let written = radio
        .admin_log()
        .into_iter()
        .find_map(|a| match a.payload_variant {
            Some(AdminPayload::SetChannel(ch)) => Some(ch),
            _ => None,
        })
        .expect("channel write");
    assert_eq!(written.index, 1);
    assert_eq!(written.role, 2);
    assert_eq!(written.settings.map(|s| s.name), Some("Admin".to_string()));

    assert!(
        wait_until(Duration::from_secs(2), || {
            manager
                .get_snapshot(h)
                .channel(1)
                .map_or(false, |c| c.role == 2)
        })
        .await
    );
}

#[tokio::test]
async fn link_loss_during_commit_reports_connection_lost() {
    let manager = ConnectionManager::default();
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT7", Policy::default()).await;
    let h = radio.handle.clone();
    radio.set_policy(|p| p.reply = Reply::Ignore);
    manager
        .edit_field(&h, key("lora"), "txPower", EditValue::Set(json!(9)))
        .await
        .unwrap();

    let commit = manager.commit(&h, &[ConfigGroup::Radio]);
    let pull = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        radio.unplug();
    };
    let (report, ()) = tokio::join!(commit, pull);
    let report = report.unwrap();
    assert_eq!(
        report.outcome(ConfigGroup::Radio),
        Some(&Err(CommitError::ConnectionLost))
    );
}

#[tokio::test]
async fn disconnect_during_commit_reports_connection_lost() {
    let manager = ConnectionManager::default();
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT8", Policy::default()).await;
    let h = radio.handle.clone();
    radio.set_policy(|p| p.reply = Reply::Ignore);
    manager
        .edit_field(&h, key("device"), "serialEnabled", EditValue::Set(json!(true)))
        .await
        .unwrap();

    let commit = manager.commit(&h, &[ConfigGroup::Radio]);
    let drop_it = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.disconnect(&h).await;
    };
    let (report, ()) = tokio::join!(commit, drop_it);
    assert_eq!(
        report.unwrap().outcome(ConfigGroup::Radio),
        Some(&Err(CommitError::ConnectionLost))
    );
}

#[tokio::test]
async fn commit_document_leaves_live_overlay_alone() {
    let manager = ConnectionManager::new(fast_settings());
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT9", Policy::default()).await;
    let h = &radio.handle;

    manager
        .edit_field(h, key("lora"), "txPower", EditValue::Set(json!(25)))
        .await
        .unwrap();

    let exported = manager.export_config(h).unwrap();
    assert_eq!(exported.radio.as_ref().unwrap()["lora"]["txPower"], 17);

    let doc: BulkConfigDocument = serde_json::from_value(json!({
        "radio": { "lora": { "hopLimit": 5 } },
        "module": { "mqtt": { "enabled": true } }
    }))
    .unwrap();
    let report = manager
        .commit_document(h, &doc, &[ConfigGroup::Radio, ConfigGroup::Module])
        .await
        .unwrap();
    assert!(report.is_success(), "{:?}", report);

    // Live edit still pending; device took the document values
    assert_eq!(manager.get_edits(h, key("lora")), Some(json!({ "txPower": 25 })));
    assert!(wait_until(Duration::from_secs(2), || lora_of(&manager, h).hop_limit == 5).await);
    let lora = lora_of(&manager, h);
    assert_eq!(lora.tx_power, 17);
    assert!(
        wait_until(Duration::from_secs(2), || {
            manager
                .get_snapshot(h)
                .modules
                .mqtt
                .as_ref()
                .map_or(false, |m| m.enabled)
        })
        .await
    );

    let bad: BulkConfigDocument = serde_json::from_value(json!({
        "radio": { "lora": { "noSuchField": 1 } }
    }))
    .unwrap();
    assert!(matches!(
        manager.commit_document(h, &bad, &[ConfigGroup::Radio]).await,
        Err(CommitError::InvalidEdit(_))
    ));
}

#[tokio::test]
async fn unreported_section_is_invalid_edit() {
    let manager = ConnectionManager::new(fast_settings());
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT10", Policy::default()).await;
    let h = &radio.handle;
    // The radio never reported bluetooth
    manager
        .edit_field(h, key("bluetooth"), "enabled", EditValue::Set(json!(true)))
        .await
        .unwrap();
    assert_eq!(manager.get_pending_changes(h, key("bluetooth")), -1);
    let report = manager.commit(h, &[ConfigGroup::Radio]).await.unwrap();
    assert!(matches!(
        report.outcome(ConfigGroup::Radio),
        Some(Err(CommitError::InvalidEdit(_)))
    ));
    assert!(radio.admin_log().is_empty());
}

#[tokio::test]
async fn edit_made_during_commit_stays_pending() {
    let manager = ConnectionManager::new(SessionSettings {
        commit_ack_timeout: Duration::from_secs(5),
        ..fast_settings()
    });
    let radio = FakeRadio::connected(&manager, "/dev/ttyCOMMIT11", Policy::default()).await;
    let h = &radio.handle;
    radio.set_policy(|p| p.reply = Reply::Ignore);

    manager
        .edit_field(h, key("lora"), "txPower", EditValue::Set(json!(20)))
        .await
        .unwrap();

    let commit = manager.commit(h, &[ConfigGroup::Radio]);
    let meddle = async {
        // Begin, the lora write and commit are on the wire but not acknowledged yet
        assert!(wait_until(Duration::from_secs(2), || radio.log.lock().unwrap().unanswered.len() == 3).await);
        manager
            .edit_field(h, key("lora"), "hopLimit", EditValue::Set(json!(6)))
            .await
            .unwrap();
        assert_eq!(radio.ack_unanswered(), 3);
    };
    let (report, ()) = tokio::join!(commit, meddle);
    assert!(report.unwrap().is_success());

    // The hop limit edit never reached the device, so it is still pending
    let edits = manager.get_edits(h, key("lora")).expect("later edit kept");
    assert_eq!(edits["hopLimit"], 6);
    assert!(manager.get_pending_changes(h, key("lora")) >= 1);

    let written = radio
        .admin_log()
        .into_iter()
        .find_map(|a| match a.payload_variant {
            Some(AdminPayload::SetConfig(cfg)) => cfg.payload_variant,
            _ => None,
        })
        .expect("lora write");
    match written {
        config::PayloadVariant::Lora(l) => assert_eq!(l.hop_limit, 3),
        other => panic!("unexpected config {:?}", other),
    }
}
