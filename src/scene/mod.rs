//! Static scene buffers.
//!
//! Built once with [`SceneBuilder`], uploaded once and read-only after.
//! Meshes share one vertex and one index array; [`PrimMeshInfo`] is the
//! per-mesh lookup that closest-hit stages use to find their triangles and
//! material.

mod builtin;

pub use builtin::cornell_box;

use crate::util::{Affine3A, BBox3f, Error, Mat3, Result, Vec3};
use bytemuck::{Pod, Zeroable};

/// Interleaved vertex (32 bytes, std430-friendly).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub u: f32,
    pub normal: [f32; 3],
    pub v: f32,
}

/// Diffuse material (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub albedo: [f32; 3],
    pub _pad: f32,
}

impl Material {
    pub const fn diffuse(r: f32, g: f32, b: f32) -> Self {
        Self {
            albedo: [r, g, b],
            _pad: 0.0,
        }
    }

    pub fn albedo(&self) -> Vec3 {
        Vec3::from(self.albedo)
    }
}

/// Per-mesh lookup (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PrimMeshInfo {
    /// First index of the mesh in the shared index array.
    pub index_offset: u32,
    /// Added to every index of the mesh.
    pub vertex_offset: u32,
    pub index_count: u32,
    pub material_index: u32,
}

impl PrimMeshInfo {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Placement of a mesh in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshInstance {
    pub mesh: u32,
    pub transform: Affine3A,
}

/// World-space triangle, as seen by the host tracer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldTriangle {
    pub v0: Vec3,
    pub v1: Vec3,
    pub v2: Vec3,
    /// Per-vertex shading normals.
    pub n: [Vec3; 3],
    pub material: u32,
}

impl WorldTriangle {
    pub fn bounds(&self) -> BBox3f {
        let mut b = BBox3f::EMPTY;
        b.expand_by_point(self.v0);
        b.expand_by_point(self.v1);
        b.expand_by_point(self.v2);
        b
    }
}

/// Immutable scene arrays.
#[derive(Debug, Clone, Default)]
pub struct SceneBuffers {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub materials: Vec<Material>,
    pub meshes: Vec<PrimMeshInfo>,
    pub instances: Vec<MeshInstance>,
}

impl SceneBuffers {
    /// World bounds of all instances.
    pub fn bounds(&self) -> BBox3f {
        let mut b = BBox3f::EMPTY;
        for tri in self.world_triangles() {
            b.expand_by_box(&tri.bounds());
        }
        b
    }

    /// Length of the world bounds diagonal.
    pub fn diagonal(&self) -> f32 {
        let b = self.bounds();
        if b.is_empty() {
            0.0
        } else {
            b.size().length()
        }
    }

    /// Flatten all instances into world-space triangles.
    pub fn world_triangles(&self) -> Vec<WorldTriangle> {
        let mut out = Vec::new();
        for inst in &self.instances {
            let mesh = &self.meshes[inst.mesh as usize];
            let normal_matrix: Mat3 = inst.transform.matrix3.inverse().transpose().into();
            let vertex = |i: u32| {
                let v = &self.vertices[(mesh.vertex_offset + i) as usize];
                (
                    inst.transform.transform_point3(Vec3::from(v.position)),
                    (normal_matrix * Vec3::from(v.normal)).normalize_or_zero(),
                )
            };
            let start = mesh.index_offset as usize;
            for tri in self.indices[start..start + mesh.index_count as usize].chunks_exact(3) {
                let (v0, n0) = vertex(tri[0]);
                let (v1, n1) = vertex(tri[1]);
                let (v2, n2) = vertex(tri[2]);
                out.push(WorldTriangle {
                    v0,
                    v1,
                    v2,
                    n: [n0, n1, n2],
                    material: mesh.material_index,
                });
            }
        }
        out
    }

    pub fn triangle_count(&self) -> usize {
        self.instances
            .iter()
            .map(|i| self.meshes[i.mesh as usize].triangle_count() as usize)
            .sum()
    }
}

/// Incrementally assembles [`SceneBuffers`].
#[derive(Debug, Default)]
pub struct SceneBuilder {
    scene: SceneBuffers,
}

impl SceneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_material(&mut self, material: Material) -> u32 {
        self.scene.materials.push(material);
        (self.scene.materials.len() - 1) as u32
    }

    /// Add a mesh. Indices are local to `vertices`.
    pub fn add_mesh(&mut self, vertices: &[Vertex], indices: &[u32], material: u32) -> u32 {
        let info = PrimMeshInfo {
            index_offset: self.scene.indices.len() as u32,
            vertex_offset: self.scene.vertices.len() as u32,
            index_count: indices.len() as u32,
            material_index: material,
        };
        self.scene.vertices.extend_from_slice(vertices);
        self.scene.indices.extend_from_slice(indices);
        self.scene.meshes.push(info);
        (self.scene.meshes.len() - 1) as u32
    }

    pub fn add_instance(&mut self, mesh: u32, transform: Affine3A) -> &mut Self {
        self.scene.instances.push(MeshInstance { mesh, transform });
        self
    }

    /// Validate cross references and finish.
    pub fn build(self) -> Result<SceneBuffers> {
        let s = &self.scene;
        for (i, mesh) in s.meshes.iter().enumerate() {
            if mesh.index_count % 3 != 0 {
                return Err(Error::InvalidScene(format!("mesh {i}: index count not a multiple of 3")));
            }
            if mesh.material_index as usize >= s.materials.len() {
                return Err(Error::InvalidScene(format!("mesh {i}: material {} missing", mesh.material_index)));
            }
            let next_vertex = s
                .meshes
                .get(i + 1)
                .map_or(s.vertices.len() as u32, |m| m.vertex_offset);
            let vertex_count = next_vertex - mesh.vertex_offset;
            let start = mesh.index_offset as usize;
            if s.indices[start..start + mesh.index_count as usize]
                .iter()
                .any(|&idx| idx >= vertex_count)
            {
                return Err(Error::InvalidScene(format!("mesh {i}: index out of range")));
            }
        }
        if let Some(inst) = s.instances.iter().find(|inst| inst.mesh as usize >= s.meshes.len()) {
            return Err(Error::InvalidScene(format!("instance of missing mesh {}", inst.mesh)));
        }
        Ok(self.scene)
    }
}

/// Two-triangle quad with a flat normal, counter-clockwise `p0..p3`.
pub fn quad(p0: Vec3, p1: Vec3, p2: Vec3, p3: Vec3) -> (Vec<Vertex>, Vec<u32>) {
    let n = (p1 - p0).cross(p2 - p0).normalize_or_zero().to_array();
    let uv = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)];
    let vertices = [p0, p1, p2, p3]
        .iter()
        .zip(uv)
        .map(|(p, (u, v))| Vertex {
            position: p.to_array(),
            u,
            normal: n,
            v,
        })
        .collect();
    (vertices, vec![0, 1, 2, 0, 2, 3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validates_indices() {
        let mut b = SceneBuilder::new();
        let m = b.add_material(Material::diffuse(0.5, 0.5, 0.5));
        let (v, _) = quad(Vec3::ZERO, Vec3::X, Vec3::ONE, Vec3::Y);
        let mesh = b.add_mesh(&v, &[0, 1, 9], m);
        b.add_instance(mesh, Affine3A::IDENTITY);
        assert!(matches!(b.build(), Err(Error::InvalidScene(_))));
    }

    #[test]
    fn test_builder_validates_material() {
        let mut b = SceneBuilder::new();
        let (v, i) = quad(Vec3::ZERO, Vec3::X, Vec3::ONE, Vec3::Y);
        b.add_mesh(&v, &i, 3);
        assert!(b.build().is_err());
    }

    #[test]
    fn test_instance_transform_applied() {
        let mut b = SceneBuilder::new();
        let m = b.add_material(Material::diffuse(0.5, 0.5, 0.5));
        let (v, i) = quad(Vec3::ZERO, Vec3::X, Vec3::new(1.0, 1.0, 0.0), Vec3::Y);
        let mesh = b.add_mesh(&v, &i, m);
        b.add_instance(mesh, Affine3A::from_translation(Vec3::new(0.0, 0.0, 5.0)));
        b.add_instance(mesh, Affine3A::from_scale(Vec3::splat(2.0)));
        let scene = b.build().unwrap();

        let tris = scene.world_triangles();
        assert_eq!(tris.len(), 4);
        assert_eq!(scene.triangle_count(), 4);
        assert_eq!(tris[0].v0.z, 5.0);
        assert!((tris[0].n[0] - Vec3::Z).length() < 1e-6);
        let bounds = scene.bounds();
        assert_eq!(bounds.max, Vec3::new(2.0, 2.0, 5.0));
    }
}
