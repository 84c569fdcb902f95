use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use meridian_core::asset::{Asset, AssetType};
use meridian_core::config::{ThrottleConfig, TransferConfig};
use meridian_core::packets::{PacketBody, TransferAbort, TransferInfo, TransferPacket, TransferRequest};
use meridian_core::wire::{PacketType, ThrottleCategory, UUID_ZERO};
use meridian_services::asset_transfer::{status, CHANNEL_ASSET};
use meridian_services::service::PERM_FULL;
use meridian_services::{
    AssetTransferService, EmptyScene, InventoryItem, SceneAccess, TransferSource, TransferState,
};

use crate::*;

const TEXTURE: [u8; 16] = [0x51; 16];
const SCRIPT: [u8; 16] = [0x52; 16];
const SHIRT: [u8; 16] = [0x53; 16];

fn request(id: u8, source: &TransferSource) -> TransferRequest {
    TransferRequest {
        transfer_id: [id; 16],
        channel_type: CHANNEL_ASSET,
        source_type: source.source_type(),
        priority: 1.0,
        params: source.to_params(),
    }
}

fn direct(asset_id: [u8; 16], asset_type: AssetType) -> TransferSource {
    TransferSource::Asset {
        asset_id,
        asset_type,
    }
}

fn service(assets: Arc<MockAssets>, scene: Arc<dyn SceneAccess>) -> AssetTransferService {
    AssetTransferService::new(assets, scene)
}

fn store() -> Arc<MockAssets> {
    let texture: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    MockAssets::with([
        Asset::new(TEXTURE, AssetType::Texture, texture),
        Asset::new(SCRIPT, AssetType::LslText, Bytes::from_static(b"default { }")),
        Asset::new(SHIRT, AssetType::Clothing, Bytes::from_static(b"shirt")),
    ])
}

#[tokio::test]
async fn texture_is_served_in_chunks() {
    let conn = connection_with(
        &ThrottleConfig::default(),
        TransferConfig {
            chunk_size: 1024,
            ..TransferConfig::default()
        },
    );
    let svc = service(store(), Arc::new(EmptyScene));

    let req = request(1, &direct(TEXTURE, AssetType::Texture));
    let state = svc.handle_request(&conn, req).unwrap().await.unwrap();
    assert_eq!(state, TransferState::Completed);

    let packets = sent(&conn);
    assert_eq!(packets.len(), 4);
    assert!(packets.iter().all(|p| p.category == ThrottleCategory::Asset));

    let info = TransferInfo::decode(&packets[0].body).unwrap();
    assert_eq!(info.status, status::OK);
    assert_eq!(info.size, 2500);

    let chunks: Vec<TransferPacket> = packets[1..]
        .iter()
        .map(|p| TransferPacket::decode(&p.body).unwrap())
        .collect();
    let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
    assert_eq!(sizes, vec![1024, 1024, 452]);
    assert_eq!(chunks.iter().map(|c| c.packet).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(chunks[0].status, status::OK);
    assert_eq!(chunks[2].status, status::DONE);

    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
    assert_eq!(joined.len(), 2500);
    assert_eq!(joined[1300], (1300 % 251) as u8);
}

#[tokio::test]
async fn abort_during_lookup_suppresses_all_output() {
    let conn = connection();
    let assets = store();
    assets.gate();
    let svc = service(assets.clone(), Arc::new(EmptyScene));

    let req = request(2, &direct(TEXTURE, AssetType::Texture));
    let task = svc.handle_request(&conn, req).unwrap();
    assets.lookup_started.notified().await;

    let abort = TransferAbort {
        transfer_id: [2; 16],
        channel_type: CHANNEL_ASSET,
    };
    assert!(!svc.handle_abort(&conn, &abort));
    assets.release();

    assert_eq!(task.await.unwrap(), TransferState::Aborted);
    assert!(sent(&conn).is_empty());
    assert!(!conn.transfers.is_cancelled(&[2; 16]));
}

#[tokio::test]
async fn abort_after_completion_is_echoed() {
    let conn = connection();
    let svc = service(store(), Arc::new(EmptyScene));

    let req = request(3, &direct(TEXTURE, AssetType::Texture));
    svc.handle_request(&conn, req).unwrap().await.unwrap();
    sent(&conn);

    let abort = TransferAbort {
        transfer_id: [3; 16],
        channel_type: CHANNEL_ASSET,
    };
    assert!(svc.handle_abort(&conn, &abort));
    let packets = sent(&conn);
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].packet_type, PacketType::TransferAbort);
}

#[tokio::test]
async fn missing_asset_reports_unknown_source() {
    let conn = connection();
    let svc = service(store(), Arc::new(EmptyScene));

    let req = request(4, &direct([0x77; 16], AssetType::Texture));
    let state = svc.handle_request(&conn, req).unwrap().await.unwrap();
    assert_eq!(state, TransferState::Unknown);

    let packets = sent(&conn);
    assert_eq!(packets.len(), 1);
    let info = TransferInfo::decode(&packets[0].body).unwrap();
    assert_eq!(info.status, status::UNKNOWN_SOURCE);
    assert_eq!(info.size, 0);
}

#[tokio::test]
async fn direct_script_request_is_refused() {
    let conn = connection();
    let svc = service(store(), Arc::new(EmptyScene));

    let req = request(5, &direct(SCRIPT, AssetType::LslText));
    let state = svc.handle_request(&conn, req).unwrap().await.unwrap();
    assert_eq!(state, TransferState::Denied);

    let packets = sent(&conn);
    assert_eq!(packets.len(), 1);
    let info = TransferInfo::decode(&packets[0].body).unwrap();
    assert_eq!(info.status, status::INSUFFICIENT_PERMISSIONS);
}

#[tokio::test]
async fn wearable_info_is_released_before_its_chunks() {
    let conn = connection_with(
        &ThrottleConfig::default(),
        TransferConfig {
            chunk_size: 2,
            ..TransferConfig::default()
        },
    );
    let svc = service(store(), Arc::new(EmptyScene));

    let req = request(6, &direct(SHIRT, AssetType::Clothing));
    svc.handle_request(&conn, req).unwrap().await.unwrap();

    let start = Instant::now();
    let mut released = Vec::new();
    for step in 1..=100u64 {
        released.extend(conn.dequeue_ready(start + Duration::from_millis(step * 100)));
        if conn.with_throttle(|t| t.total_queued()) == 0 {
            break;
        }
    }

    let order: Vec<PacketType> = released.iter().map(|p| p.packet_type).collect();
    assert_eq!(
        order,
        vec![
            PacketType::TransferInfo,
            PacketType::TransferPacket,
            PacketType::TransferPacket,
            PacketType::TransferPacket,
        ]
    );
    assert!(released.iter().all(|p| p.category == ThrottleCategory::Task));
}

fn script_in_object(owner: [u8; 16]) -> InventoryItem {
    InventoryItem {
        item_id: [0x61; 16],
        owner_id: owner,
        asset_id: SCRIPT,
        asset_type: AssetType::LslText,
        current_permissions: PERM_FULL,
    }
}

fn task_source() -> TransferSource {
    TransferSource::InventoryItem {
        agent_id: AGENT,
        session_id: SESSION,
        owner_id: AGENT,
        task_id: [0x70; 16],
        item_id: [0x61; 16],
        asset_id: SCRIPT,
        asset_type: AssetType::LslText,
    }
}

#[tokio::test]
async fn task_script_needs_edit_rights() {
    let conn = connection();
    let scene = MockScene {
        owns_objects: true,
        can_edit_scripts: false,
        object_items: HashMap::from([([0x61; 16], script_in_object(AGENT))]),
        ..MockScene::default()
    };
    let svc = service(store(), Arc::new(scene));

    assert!(svc.handle_request(&conn, request(7, &task_source())).is_none());
    assert_eq!(conn.transfers.state(&[7; 16]), Some(TransferState::Denied));
    assert!(sent(&conn).is_empty());
}

#[tokio::test]
async fn task_script_with_edit_rights_is_served() {
    let conn = connection();
    let scene = MockScene {
        owns_objects: true,
        can_edit_scripts: true,
        object_items: HashMap::from([([0x61; 16], script_in_object(AGENT))]),
        ..MockScene::default()
    };
    let svc = service(store(), Arc::new(scene));

    let state = svc
        .handle_request(&conn, request(8, &task_source()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(state, TransferState::Completed);

    let packets = sent(&conn);
    let chunk = TransferPacket::decode(&packets[1].body).unwrap();
    assert_eq!(&chunk.data[..], b"default { }");
}

#[tokio::test]
async fn agent_inventory_notecard_needs_full_permissions() {
    let conn = connection();
    let notecard = InventoryItem {
        item_id: [0x62; 16],
        owner_id: AGENT,
        asset_id: TEXTURE,
        asset_type: AssetType::Notecard,
        current_permissions: 0,
    };
    let scene = MockScene {
        agent_items: HashMap::from([([0x62; 16], notecard)]),
        ..MockScene::default()
    };
    let svc = service(store(), Arc::new(scene));

    let source = TransferSource::InventoryItem {
        agent_id: AGENT,
        session_id: SESSION,
        owner_id: AGENT,
        task_id: UUID_ZERO,
        item_id: [0x62; 16],
        asset_id: TEXTURE,
        asset_type: AssetType::Notecard,
    };
    assert!(svc.handle_request(&conn, request(9, &source)).is_none());
}
