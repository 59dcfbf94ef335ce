//! Releases every GPU resource a scene holds.
//!
//! Handles are taken out of the scene as they are visited, so a texture
//! shared by several materials (or slots) is released exactly once and a
//! second walk over the same scene releases nothing.

use crate::scene::{GeometryHandle, SceneGraph, TextureHandle, TextureSlot};

pub trait ResourceVisitor {
    fn geometry(&mut self, handle: GeometryHandle);
    fn texture(&mut self, slot: Option<TextureSlot>, handle: TextureHandle);
}

/// Walks meshes, then every material slot, then sweeps textures no material
/// references.
pub fn visit_resources(scene: &mut SceneGraph, visitor: &mut impl ResourceVisitor) {
    for mesh in &mut scene.meshes {
        if let Some(handle) = mesh.gpu.take() {
            visitor.geometry(handle);
        }
    }
    for material in &scene.materials {
        for slot in TextureSlot::ALL {
            let Some(index) = material.texture(slot) else {
                continue;
            };
            if let Some(handle) = scene.textures.get_mut(index).and_then(|t| t.gpu.take()) {
                visitor.texture(Some(slot), handle);
            }
        }
    }
    for texture in &mut scene.textures {
        if let Some(handle) = texture.gpu.take() {
            visitor.texture(None, handle);
        }
    }
}

/// Number of handles a walk released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub geometries: usize,
    pub textures: usize,
}

impl Released {
    pub fn total(&self) -> usize {
        self.geometries + self.textures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Material, Mesh, Texture, TextureImage};

    #[derive(Default)]
    struct Collect {
        geometries: Vec<GeometryHandle>,
        textures: Vec<(Option<TextureSlot>, TextureHandle)>,
    }

    impl ResourceVisitor for Collect {
        fn geometry(&mut self, handle: GeometryHandle) {
            self.geometries.push(handle);
        }

        fn texture(&mut self, slot: Option<TextureSlot>, handle: TextureHandle) {
            self.textures.push((slot, handle));
        }
    }

    fn uploaded_scene() -> SceneGraph {
        let image = TextureImage {
            width: 1,
            height: 1,
            rgba: vec![255; 4],
        };
        let mut textures = vec![
            Texture::embedded(image.clone()),
            Texture::embedded(image.clone()),
            Texture::embedded(image),
        ];
        for (i, texture) in textures.iter_mut().enumerate() {
            texture.gpu = Some(TextureHandle(10 + i as u64));
        }
        let mut paint = Material::named("paint");
        paint.set_texture(TextureSlot::BaseColor, Some(0));
        paint.set_texture(TextureSlot::Emissive, Some(0));
        let mut metal = Material::named("metal");
        metal.set_texture(TextureSlot::Alpha, Some(1));
        SceneGraph {
            meshes: vec![
                Mesh {
                    gpu: Some(GeometryHandle(1)),
                    ..Mesh::default()
                },
                Mesh {
                    gpu: Some(GeometryHandle(2)),
                    ..Mesh::default()
                },
            ],
            materials: vec![paint, metal],
            textures,
            ..SceneGraph::default()
        }
    }

    #[test]
    fn every_handle_is_released_once() {
        let mut scene = uploaded_scene();
        let mut collect = Collect::default();
        visit_resources(&mut scene, &mut collect);
        assert_eq!(collect.geometries, vec![GeometryHandle(1), GeometryHandle(2)]);
        assert_eq!(
            collect.textures,
            vec![
                (Some(TextureSlot::BaseColor), TextureHandle(10)),
                (Some(TextureSlot::Alpha), TextureHandle(11)),
                (None, TextureHandle(12)),
            ]
        );

        let mut again = Collect::default();
        visit_resources(&mut scene, &mut again);
        assert!(again.geometries.is_empty() && again.textures.is_empty());
    }
}
