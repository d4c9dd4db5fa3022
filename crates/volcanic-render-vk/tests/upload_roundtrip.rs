// SPDX-License-Identifier: CEPL-1.0
//! Uploads through a real device. Skipped when no Vulkan loader or GPU is present.
use volcanic_render::{AssetError, MeshBuilder, MeshData, TextureData, Vertex};
use volcanic_render_vk::{vk, HeadlessContext, ValidationMode, VkError};

fn context() -> Option<HeadlessContext> {
    volcanic_core::init_tracing();
    match HeadlessContext::new(ValidationMode::Auto) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device ({e:#})");
            None
        }
    }
}

fn checkerboard(size: u32) -> Vec<u8> {
    let mut px = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let v = if (x / 8 + y / 8) % 2 == 0 { 255 } else { 32 };
            px.extend_from_slice(&[v, v, v, 255]);
        }
    }
    px
}

#[test]
fn buffer_contents_survive_the_round_trip() {
    let Some(ctx) = context() else { return };
    let bytes: Vec<u8> = (0..=255u8).cycle().take(4096 + 3).collect();
    let buf = ctx
        .transfer()
        .upload_buffer(ctx.device(), &bytes, vk::BufferUsageFlags::VERTEX_BUFFER)
        .unwrap();
    assert_eq!(buf.size(), bytes.len() as u64);
    let back = ctx.transfer().download_buffer(ctx.device(), &buf).unwrap();
    assert_eq!(back, bytes);
}

#[test]
fn mesh_upload_keeps_index_count() {
    let Some(ctx) = context() else { return };
    let mut mb = MeshBuilder::new();
    mb.extend([
        Vertex::new([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0]),
        Vertex::new([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0]),
        Vertex::new([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
    ]);
    let mesh = mb.finish();
    let bufs = ctx.transfer().upload_mesh(ctx.device(), &mesh).unwrap();
    assert_eq!(bufs.index_count, 3);
    let idx = ctx
        .transfer()
        .download_buffer(ctx.device(), &bufs.index)
        .unwrap();
    assert_eq!(idx, mesh.index_bytes());
}

#[test]
fn empty_mesh_is_rejected() {
    let Some(ctx) = context() else { return };
    let err = ctx
        .transfer()
        .upload_mesh(ctx.device(), &MeshData::default())
        .err()
        .expect("empty mesh must fail");
    assert!(matches!(
        err.downcast_ref::<VkError>(),
        Some(VkError::InvalidUpload(_))
    ));
}

#[test]
fn mesh_with_stray_index_is_rejected() {
    let Some(ctx) = context() else { return };
    let mesh = MeshData {
        vertices: vec![Vertex::default(); 3],
        indices: vec![0, 1, 7],
    };
    let err = ctx
        .transfer()
        .upload_mesh(ctx.device(), &mesh)
        .err()
        .expect("index past the vertex list must fail");
    assert!(matches!(
        err.downcast_ref::<VkError>(),
        Some(VkError::InvalidUpload(AssetError::IndexOutOfRange {
            index: 7,
            vertex_count: 3
        }))
    ));
}

#[test]
fn texture_gets_a_full_mip_chain() {
    let Some(ctx) = context() else { return };
    let px = checkerboard(64);
    let tex = TextureData::rgba(&px, 64, 64);
    match ctx.transfer().upload_image(ctx.device(), &tex, true) {
        Ok(t) => assert_eq!(t.mip_levels(), 7),
        Err(e) => assert!(
            matches!(
                e.downcast_ref::<VkError>(),
                Some(VkError::UnsupportedBlitFormat { .. })
            ),
            "unexpected error {e:#}"
        ),
    }
}

#[test]
fn texture_without_mips_has_one_level() {
    let Some(ctx) = context() else { return };
    let px = checkerboard(16);
    let tex = TextureData::rgba(&px, 16, 16);
    let t = ctx
        .transfer()
        .upload_image(ctx.device(), &tex, false)
        .unwrap();
    assert_eq!(t.mip_levels(), 1);
}

#[test]
fn short_pixel_buffer_is_rejected() {
    let Some(ctx) = context() else { return };
    let px = vec![0u8; 10];
    let tex = TextureData::rgba(&px, 4, 4);
    let err = ctx
        .transfer()
        .upload_image(ctx.device(), &tex, false)
        .err()
        .expect("short buffer must fail");
    assert!(matches!(
        err.downcast_ref::<VkError>(),
        Some(VkError::InvalidUpload(_))
    ));
}
