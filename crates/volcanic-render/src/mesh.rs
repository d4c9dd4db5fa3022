// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;

use crate::texture::AssetError;

/// Interleaved vertex as consumed by the mesh pipeline (binding 0, stride 32).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub const fn new(pos: [f32; 3], color: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            pos,
            color,
            tex_coord,
        }
    }

    // -0.0 and 0.0 compare equal, so they must hash equal too.
    fn key(&self) -> [u32; 8] {
        let mut key = [0u32; 8];
        let comps = self
            .pos
            .iter()
            .chain(self.color.iter())
            .chain(self.tex_coord.iter());
        for (slot, &c) in key.iter_mut().zip(comps) {
            *slot = if c == 0.0 { 0 } else { c.to_bits() };
        }
        key
    }
}

#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }

    /// Non-empty, and every index names an existing vertex.
    pub fn validate(&self) -> Result<(), AssetError> {
        if self.is_empty() {
            return Err(AssetError::EmptyMesh);
        }
        let vertex_count = self.vertices.len();
        match self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            Some(&index) => Err(AssetError::IndexOutOfRange {
                index,
                vertex_count,
            }),
            None => Ok(()),
        }
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

/// Builds an indexed mesh from a triangle soup, collapsing identical vertices.
#[derive(Default)]
pub struct MeshBuilder {
    mesh: MeshData,
    seen: HashMap<[u32; 8], u32>,
}

impl MeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, v: Vertex) -> u32 {
        let next = self.mesh.vertices.len() as u32;
        let idx = *self.seen.entry(v.key()).or_insert_with(|| {
            self.mesh.vertices.push(v);
            next
        });
        self.mesh.indices.push(idx);
        idx
    }

    pub fn extend<I: IntoIterator<Item = Vertex>>(&mut self, verts: I) {
        for v in verts {
            self.push(v);
        }
    }

    pub fn finish(self) -> MeshData {
        self.mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::offset_of!(Vertex, pos), 0);
        assert_eq!(std::mem::offset_of!(Vertex, color), 12);
        assert_eq!(std::mem::offset_of!(Vertex, tex_coord), 24);
    }

    #[test]
    fn identical_vertices_share_an_index() {
        let a = Vertex::new([0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0]);
        let b = Vertex::new([1.0, 0.0, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0]);
        let mut mb = MeshBuilder::new();
        mb.extend([a, b, a, a]);
        let mesh = mb.finish();
        assert_eq!(mesh.vertices.len(), 2);
        assert_eq!(mesh.indices, vec![0, 1, 0, 0]);
    }

    #[test]
    fn negative_zero_dedups_with_zero() {
        let a = Vertex::new([0.0, 0.0, 0.0], [1.0; 3], [0.0, 0.0]);
        let b = Vertex::new([-0.0, 0.0, 0.0], [1.0; 3], [0.0, -0.0]);
        let mut mb = MeshBuilder::new();
        mb.push(a);
        mb.push(b);
        assert_eq!(mb.finish().vertices.len(), 1);
    }

    #[test]
    fn stray_index_fails_validation() {
        let mesh = MeshData {
            vertices: vec![Vertex::default(); 3],
            indices: vec![0, 1, 3],
        };
        assert_eq!(
            mesh.validate(),
            Err(AssetError::IndexOutOfRange {
                index: 3,
                vertex_count: 3
            })
        );
        assert_eq!(MeshData::default().validate(), Err(AssetError::EmptyMesh));

        let mut mb = MeshBuilder::new();
        mb.extend([Vertex::default(); 3]);
        assert_eq!(mb.finish().validate(), Ok(()));
    }

    #[test]
    fn byte_views_match_element_sizes() {
        let mut mb = MeshBuilder::new();
        mb.push(Vertex::default());
        let mesh = mb.finish();
        assert_eq!(mesh.vertex_bytes().len(), 32);
        assert_eq!(mesh.index_bytes().len(), 4);
        assert!(!mesh.is_empty());
        assert!(MeshData::default().is_empty());
    }
}
