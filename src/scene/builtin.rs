//! Built-in test scene.

use super::{quad, Material, SceneBuffers, SceneBuilder, Vertex};
use crate::util::{Affine3A, Quat, Result, Vec3};

/// Unit cube centered at the origin, 24 vertices with face normals.
fn unit_cube() -> (Vec<Vertex>, Vec<u32>) {
    let h = 0.5;
    let faces = [
        // +x, -x, +y, -y, +z, -z
        [Vec3::new(h, -h, h), Vec3::new(h, -h, -h), Vec3::new(h, h, -h), Vec3::new(h, h, h)],
        [Vec3::new(-h, -h, -h), Vec3::new(-h, -h, h), Vec3::new(-h, h, h), Vec3::new(-h, h, -h)],
        [Vec3::new(-h, h, h), Vec3::new(h, h, h), Vec3::new(h, h, -h), Vec3::new(-h, h, -h)],
        [Vec3::new(-h, -h, -h), Vec3::new(h, -h, -h), Vec3::new(h, -h, h), Vec3::new(-h, -h, h)],
        [Vec3::new(-h, -h, h), Vec3::new(h, -h, h), Vec3::new(h, h, h), Vec3::new(-h, h, h)],
        [Vec3::new(h, -h, -h), Vec3::new(-h, -h, -h), Vec3::new(-h, h, -h), Vec3::new(h, h, -h)],
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for [p0, p1, p2, p3] in faces {
        let (v, i) = quad(p0, p1, p2, p3);
        let base = vertices.len() as u32;
        vertices.extend(v);
        indices.extend(i.into_iter().map(|x| x + base));
    }
    (vertices, indices)
}

/// Cornell box, 10 units wide, open towards +z.
///
/// Floor at y = 0, ceiling at y = 10, red wall at x = -5, green wall at
/// x = +5 and two rotated blocks sharing one cube mesh.
pub fn cornell_box() -> Result<SceneBuffers> {
    let mut b = SceneBuilder::new();
    let white = b.add_material(Material::diffuse(0.73, 0.73, 0.73));
    let red = b.add_material(Material::diffuse(0.65, 0.05, 0.05));
    let green = b.add_material(Material::diffuse(0.12, 0.45, 0.15));

    let s = 5.0;
    let top = 10.0;
    let walls = [
        // floor, ceiling, back, left, right (all facing inward)
        ([Vec3::new(-s, 0.0, s), Vec3::new(s, 0.0, s), Vec3::new(s, 0.0, -s), Vec3::new(-s, 0.0, -s)], white),
        ([Vec3::new(-s, top, -s), Vec3::new(s, top, -s), Vec3::new(s, top, s), Vec3::new(-s, top, s)], white),
        ([Vec3::new(-s, 0.0, -s), Vec3::new(s, 0.0, -s), Vec3::new(s, top, -s), Vec3::new(-s, top, -s)], white),
        ([Vec3::new(-s, 0.0, s), Vec3::new(-s, 0.0, -s), Vec3::new(-s, top, -s), Vec3::new(-s, top, s)], red),
        ([Vec3::new(s, 0.0, -s), Vec3::new(s, 0.0, s), Vec3::new(s, top, s), Vec3::new(s, top, -s)], green),
    ];
    for ([p0, p1, p2, p3], material) in walls {
        let (v, i) = quad(p0, p1, p2, p3);
        let mesh = b.add_mesh(&v, &i, material);
        b.add_instance(mesh, Affine3A::IDENTITY);
    }

    let (v, i) = unit_cube();
    let cube = b.add_mesh(&v, &i, white);
    b.add_instance(
        cube,
        Affine3A::from_scale_rotation_translation(
            Vec3::splat(3.0),
            Quat::from_rotation_y((-18.0f32).to_radians()),
            Vec3::new(1.8, 1.5, 1.0),
        ),
    );
    b.add_instance(
        cube,
        Affine3A::from_scale_rotation_translation(
            Vec3::new(3.0, 6.0, 3.0),
            Quat::from_rotation_y(15.0f32.to_radians()),
            Vec3::new(-1.7, 3.0, -1.5),
        ),
    );

    b.build()
}
