use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Backend-issued identifier of an uploaded vertex/index buffer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryHandle(pub u64);

/// Backend-issued identifier of an uploaded texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Every material texture slot the viewer knows about.
///
/// Disposal walks [`TextureSlot::ALL`], so adding a slot here is enough for
/// its textures to be released on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureSlot {
    BaseColor,
    Normal,
    MetallicRoughness,
    Occlusion,
    Emissive,
    Specular,
    Bump,
    Alpha,
}

impl TextureSlot {
    pub const COUNT: usize = 8;

    pub const ALL: [TextureSlot; Self::COUNT] = [
        Self::BaseColor,
        Self::Normal,
        Self::MetallicRoughness,
        Self::Occlusion,
        Self::Emissive,
        Self::Specular,
        Self::Bump,
        Self::Alpha,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Local transform of a scene node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_matrix(matrix: Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self {
            translation,
            rotation,
            scale,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SceneNode {
    pub name: String,
    pub transform: Transform,
    /// Indices into [`SceneGraph::meshes`].
    pub meshes: Vec<usize>,
    pub children: Vec<SceneNode>,
}

impl SceneNode {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Triangle mesh with optional per-vertex attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mesh {
    pub name: String,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub indices: Vec<u32>,
    pub material: Option<usize>,
    pub gpu: Option<GeometryHandle>,
}

impl Mesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Fills in smooth normals when the source provided none (or only zeros).
    pub fn ensure_normals(&mut self) {
        let missing = self.normals.len() != self.positions.len()
            || self.normals.iter().any(|n| *n == Vec3::ZERO);
        if missing {
            self.compute_normals();
        }
    }

    fn compute_normals(&mut self) {
        let mut accum = vec![Vec3::ZERO; self.positions.len()];
        for triangle in self.indices.chunks_exact(3) {
            let [i0, i1, i2] = [
                triangle[0] as usize,
                triangle[1] as usize,
                triangle[2] as usize,
            ];
            if i0 >= accum.len() || i1 >= accum.len() || i2 >= accum.len() {
                continue;
            }
            let p0 = self.positions[i0];
            let normal = (self.positions[i1] - p0).cross(self.positions[i2] - p0);
            if normal.length_squared() > f32::EPSILON {
                let normal = normal.normalize();
                accum[i0] += normal;
                accum[i1] += normal;
                accum[i2] += normal;
            }
        }
        self.normals = accum.into_iter().map(Vec3::normalize_or_zero).collect();
    }

    /// Vertex buffer contents: `position.xyz`, `normal.xyz`, `uv.xy`.
    pub fn interleaved(&self) -> Vec<f32> {
        let mut vertices = Vec::with_capacity(self.positions.len() * 8);
        for (i, position) in self.positions.iter().enumerate() {
            let normal = self.normals.get(i).copied().unwrap_or(Vec3::Y);
            let uv = self.uvs.get(i).copied().unwrap_or(Vec2::ZERO);
            vertices.extend_from_slice(&[
                position.x, position.y, position.z, normal.x, normal.y, normal.z, uv.x, uv.y,
            ]);
        }
        vertices
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub base_color: Vec4,
    textures: [Option<usize>; TextureSlot::COUNT],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_color: Vec4::new(0.8, 0.8, 0.8, 1.0),
            textures: [None; TextureSlot::COUNT],
        }
    }
}

impl Material {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Index into [`SceneGraph::textures`] bound to `slot`.
    pub fn texture(&self, slot: TextureSlot) -> Option<usize> {
        self.textures[slot.index()]
    }

    pub fn set_texture(&mut self, slot: TextureSlot, texture: Option<usize>) {
        self.textures[slot.index()] = texture;
    }
}

/// Decoded RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureSource {
    /// Resolved location of an external image file.
    Uri(String),
    /// Pixels stored inside the model file itself.
    Embedded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    pub source: TextureSource,
    pub image: Option<TextureImage>,
    pub gpu: Option<TextureHandle>,
}

impl Texture {
    pub fn external(uri: impl Into<String>) -> Self {
        Self {
            source: TextureSource::Uri(uri.into()),
            image: None,
            gpu: None,
        }
    }

    pub fn embedded(image: TextureImage) -> Self {
        Self {
            source: TextureSource::Embedded,
            image: Some(image),
            gpu: None,
        }
    }
}

/// Parsed hierarchy of one model.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SceneGraph {
    pub root: SceneNode,
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Material>,
    pub textures: Vec<Texture>,
}

impl SceneGraph {
    /// Calls `visit` for every node with its accumulated world matrix.
    pub fn visit_nodes(&self, mut visit: impl FnMut(&SceneNode, Mat4)) {
        fn walk(node: &SceneNode, parent: Mat4, visit: &mut dyn FnMut(&SceneNode, Mat4)) {
            let world = parent * node.transform.matrix();
            visit(node, world);
            for child in &node.children {
                walk(child, world, visit);
            }
        }
        walk(&self.root, Mat4::IDENTITY, &mut visit);
    }

    /// Axis-aligned bounds of all geometry in world space, or `None` for a
    /// scene without vertices.
    pub fn world_bounds(&self) -> Option<Aabb> {
        let mut bounds: Option<Aabb> = None;
        self.visit_nodes(|node, world| {
            for &mesh_index in &node.meshes {
                let Some(mesh) = self.meshes.get(mesh_index) else {
                    continue;
                };
                for position in &mesh.positions {
                    let point = world.transform_point3(*position);
                    bounds = Some(match bounds {
                        Some(aabb) => aabb.including(point),
                        None => Aabb::point(point),
                    });
                }
            }
        });
        bounds
    }

    pub fn triangle_count(&self) -> usize {
        self.meshes.iter().map(Mesh::triangle_count).sum()
    }

    pub fn vertex_count(&self) -> usize {
        self.meshes.iter().map(|mesh| mesh.positions.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.iter().all(|mesh| mesh.indices.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn point(point: Vec3) -> Self {
        Self {
            min: point,
            max: point,
        }
    }

    pub fn including(self, point: Vec3) -> Self {
        Self {
            min: self.min.min(point),
            max: self.max.max(point),
        }
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn max_dimension(&self) -> f32 {
        self.size().max_element()
    }

    /// A box with no extent or non-finite corners.
    pub fn is_degenerate(&self) -> bool {
        let max_dimension = self.max_dimension();
        !self.min.is_finite() || !self.max.is_finite() || max_dimension <= f32::EPSILON
    }
}
