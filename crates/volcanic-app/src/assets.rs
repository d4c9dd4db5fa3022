// SPDX-License-Identifier: CEPL-1.0
use volcanic_render::{MeshBuilder, MeshData, Vertex};

type V3 = [f32; 3];

// (outward normal, u, v) with u x v == normal, so corners walked
// -u-v, +u-v, +u+v, -u+v are counter-clockwise seen from outside.
const FACES: [(V3, V3, V3); 6] = [
    ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
    ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
    ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
    ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
];

const FACE_TINTS: [V3; 6] = [
    [1.0, 0.55, 0.45],
    [0.45, 1.0, 0.55],
    [0.55, 0.45, 1.0],
    [1.0, 1.0, 0.5],
    [0.5, 1.0, 1.0],
    [1.0, 0.5, 1.0],
];

/// Unit cube centred on the origin, one tint and a full texture per face.
pub fn textured_cube() -> MeshData {
    let mut mb = MeshBuilder::new();
    for ((n, u, v), tint) in FACES.iter().zip(FACE_TINTS) {
        let corner = |su: f32, sv: f32, tex: [f32; 2]| {
            let pos = [0usize, 1, 2].map(|i| 0.5 * (n[i] + su * u[i] + sv * v[i]));
            Vertex::new(pos, tint, tex)
        };
        let quad = [
            corner(-1.0, -1.0, [0.0, 1.0]),
            corner(1.0, -1.0, [1.0, 1.0]),
            corner(1.0, 1.0, [1.0, 0.0]),
            corner(-1.0, 1.0, [0.0, 0.0]),
        ];
        // two triangles as a plain soup; the builder collapses the shared corners
        mb.extend([quad[0], quad[1], quad[2], quad[2], quad[3], quad[0]]);
    }
    mb.finish()
}

/// Square RGBA8 checkerboard with `cells` squares per side.
pub fn checkerboard(size: u32, cells: u32) -> Vec<u8> {
    const LIGHT: [u8; 4] = [235, 235, 235, 255];
    const DARK: [u8; 4] = [40, 40, 48, 255];
    let cell = (size / cells.max(1)).max(1);
    let mut out = Vec::with_capacity(size as usize * size as usize * 4);
    for y in 0..size {
        for x in 0..size {
            let px = if (x / cell + y / cell) % 2 == 0 { LIGHT } else { DARK };
            out.extend_from_slice(&px);
        }
    }
    out
}
