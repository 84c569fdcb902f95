use meridian_core::packets::{LayerData, PacketBody};
use meridian_core::terrain::{decode_layer_data, LayerType, TerrainData};
use meridian_core::wire::{PacketType, ThrottleCategory};

use crate::*;

fn rolling_hills() -> TerrainData {
    let mut heights = vec![0f32; 256 * 256];
    for (i, h) in heights.iter_mut().enumerate() {
        let (x, y) = ((i % 256) as f32, (i / 256) as f32);
        *h = 20.0 + (x * 0.11).sin() * 6.0 + (y * 0.07).cos() * 4.0;
    }
    TerrainData::from_heights(256, 256, heights).unwrap()
}

#[test]
fn whole_region_goes_out_as_land_packets() {
    let conn = connection();
    let terrain = rolling_hills();
    let patches = terrain.all_patches();
    assert_eq!(patches.len(), 256);

    let queued = conn.send_land_patches(&terrain, &patches).unwrap();
    let packets = sent(&conn);
    assert_eq!(packets.len(), queued);
    assert!(queued > 1);

    let mut seen = Vec::new();
    for p in &packets {
        assert_eq!(p.packet_type, PacketType::LayerData);
        assert_eq!(p.category, ThrottleCategory::Land);
        assert!(p.wire_len() <= 1400, "LayerData packet of {} bytes", p.wire_len());

        let layer = LayerData::decode(&p.body).unwrap();
        assert_eq!(layer.layer_type, LayerType::Land as u8);
        let (_, decoded) = decode_layer_data(&layer.data).unwrap();
        for patch in decoded {
            let (x, y) = (patch.x, patch.y);
            for (i, h) in patch.heights.iter().enumerate() {
                let (cx, cy) = (x * 16 + (i % 16) as u32, y * 16 + (i / 16) as u32);
                let original = terrain.get(cx, cy);
                assert!((h - original).abs() < 0.5, "patch ({x},{y}) cell {i}: {h} vs {original}");
            }
            seen.push((x, y));
        }
    }
    assert_eq!(seen, patches);
}

#[test]
fn flat_patches_stay_exact() {
    let conn = connection();
    let terrain = TerrainData::flat(256, 256, 21.0).unwrap();
    conn.send_land_patches(&terrain, &[(0, 0), (15, 15)]).unwrap();

    let packets = sent(&conn);
    assert_eq!(packets.len(), 1);
    let layer = LayerData::decode(&packets[0].body).unwrap();
    let (_, decoded) = decode_layer_data(&layer.data).unwrap();
    assert_eq!(decoded.len(), 2);
    for patch in decoded {
        assert!(patch.heights.iter().all(|h| (h - 21.0).abs() < 1e-3));
    }
}

#[test]
fn out_of_range_patch_is_an_error() {
    let conn = connection();
    let terrain = TerrainData::flat(256, 256, 0.0).unwrap();
    assert!(conn.send_land_patches(&terrain, &[(16, 0)]).is_err());
    assert!(sent(&conn).is_empty());
}

#[test]
fn tower_taller_than_header_range_is_an_error() {
    let conn = connection();
    let mut heights = vec![0f32; 256 * 256];
    heights[17 * 256 + 17] = 70_000.0;
    let terrain = TerrainData::from_heights(256, 256, heights).unwrap();

    assert!(conn.send_land_patches(&terrain, &[(0, 0), (1, 1)]).is_err());
    assert!(sent(&conn).is_empty());
}
