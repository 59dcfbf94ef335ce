//! glTF 2.0 in both containers: binary `.glb` and JSON `.gltf`.

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use glam::{Mat4, Vec2, Vec3, Vec4};
use gltf::Gltf;

use super::{decode_image, parse_error, FormatParser, ParseInput};
use crate::error::{leading_content, preview_bytes, ParseError};
use crate::format::ModelFormat;
use crate::scene::{
    Material, Mesh, SceneGraph, SceneNode, Texture, TextureImage, TextureSlot, TextureSource,
    Transform,
};
use crate::transport::resolve_relative;

const MAGIC: &[u8] = b"glTF";

#[derive(Debug, Clone, Copy)]
pub struct GltfParser {
    format: ModelFormat,
}

impl GltfParser {
    pub const BINARY: GltfParser = GltfParser {
        format: ModelFormat::Glb,
    };
    pub const TEXT: GltfParser = GltfParser {
        format: ModelFormat::Gltf,
    };
}

impl FormatParser for GltfParser {
    fn format(&self) -> ModelFormat {
        self.format
    }

    fn dependencies(&self, bytes: &[u8]) -> Vec<String> {
        let Ok(gltf) = Gltf::from_slice(bytes) else {
            return Vec::new();
        };
        gltf.buffers()
            .filter_map(|buffer| match buffer.source() {
                gltf::buffer::Source::Uri(uri) if !uri.starts_with("data:") => Some(uri.to_string()),
                _ => None,
            })
            .collect()
    }

    fn parse(&self, input: &ParseInput<'_>) -> Result<SceneGraph, ParseError> {
        check_json_start(self.format, input.bytes)?;
        build_scene(input).map_err(|err| parse_error(self.format, err, input.bytes))
    }
}

/// Rejects bodies that are neither a GLB container nor a JSON object, with
/// the wording a JSON parser uses for an unexpected leading character.
fn check_json_start(format: ModelFormat, bytes: &[u8]) -> Result<(), ParseError> {
    if bytes.starts_with(MAGIC) {
        return Ok(());
    }
    let text = leading_content(bytes);
    let Some(&first) = text.first() else {
        return Err(ParseError::new(format, "Unexpected end of JSON input", bytes));
    };
    if first == b'{' {
        return Ok(());
    }
    let token = preview_bytes(&text[..1]);
    let snippet = preview_bytes(&text[..text.len().min(10)]);
    Err(ParseError::new(
        format,
        format!("SyntaxError: Unexpected token '{token}', \"{snippet}\"... is not valid JSON"),
        text,
    ))
}

fn build_scene(input: &ParseInput<'_>) -> Result<SceneGraph> {
    let gltf = Gltf::from_slice(input.bytes).context("Failed to parse glTF document")?;
    let buffers = load_buffers(&gltf, input)?;

    let mut scene = SceneGraph::default();

    for texture in gltf.textures() {
        scene.textures.push(load_texture(&texture, &buffers, input));
    }

    for material in gltf.materials() {
        scene.materials.push(convert_material(&material));
    }

    // glTF meshes expand to one scene mesh per primitive.
    let mut primitives_of_mesh = Vec::new();
    for mesh in gltf.meshes() {
        let mut indices = Vec::new();
        for (index, primitive) in mesh.primitives().enumerate() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                log::warn!(
                    "skipping primitive {index} of mesh {}: unsupported mode {:?}",
                    mesh.index(),
                    primitive.mode()
                );
                continue;
            }
            let name = mesh
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("mesh-{}", mesh.index()));
            let converted = convert_primitive(&primitive, &buffers, name)?;
            indices.push(scene.meshes.len());
            scene.meshes.push(converted);
        }
        primitives_of_mesh.push(indices);
    }

    scene.root = SceneNode::named("root");
    let gltf_scene = gltf.default_scene().or_else(|| gltf.scenes().next());
    match gltf_scene {
        Some(gltf_scene) => {
            for node in gltf_scene.nodes() {
                scene.root.children.push(convert_node(&node, &primitives_of_mesh));
            }
        }
        None => {
            scene.root.meshes = primitives_of_mesh.into_iter().flatten().collect();
        }
    }

    if scene.meshes.is_empty() {
        bail!("glTF document contains no triangle meshes");
    }
    Ok(scene)
}

fn load_buffers(gltf: &Gltf, input: &ParseInput<'_>) -> Result<Vec<Vec<u8>>> {
    let mut buffers = Vec::new();
    for buffer in gltf.buffers() {
        let data = match buffer.source() {
            gltf::buffer::Source::Bin => gltf
                .blob
                .clone()
                .ok_or_else(|| anyhow!("GLB file references a binary chunk but it is missing"))?,
            gltf::buffer::Source::Uri(uri) if uri.starts_with("data:") => decode_data_uri(uri)?,
            gltf::buffer::Source::Uri(uri) => input
                .resource(uri)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| anyhow!("external buffer {uri} was not loaded"))?,
        };
        if data.len() < buffer.length() {
            bail!(
                "buffer {} is {} bytes, expected {}",
                buffer.index(),
                data.len(),
                buffer.length()
            );
        }
        buffers.push(data);
    }
    Ok(buffers)
}

fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let (header, payload) = uri
        .split_once(',')
        .ok_or_else(|| anyhow!("malformed data URI"))?;
    if !header.ends_with(";base64") {
        bail!("unsupported data URI encoding: {header}");
    }
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("invalid base64 in data URI")
}

fn load_texture(texture: &gltf::Texture<'_>, buffers: &[Vec<u8>], input: &ParseInput<'_>) -> Texture {
    match texture.source().source() {
        gltf::image::Source::View { view, .. } => {
            let start = view.offset();
            let end = start + view.length();
            let decoded = buffers
                .get(view.buffer().index())
                .and_then(|buffer| buffer.get(start..end))
                .ok_or_else(|| anyhow!("image view is out of range"))
                .and_then(decode_image);
            embedded_or_placeholder(decoded, texture.index())
        }
        gltf::image::Source::Uri { uri, .. } if uri.starts_with("data:") => {
            let decoded = decode_data_uri(uri).and_then(|bytes| decode_image(&bytes));
            embedded_or_placeholder(decoded, texture.index())
        }
        gltf::image::Source::Uri { uri, .. } => {
            Texture::external(resolve_relative(input.resource_base, uri))
        }
    }
}

fn embedded_or_placeholder(decoded: Result<TextureImage>, index: usize) -> Texture {
    match decoded {
        Ok(image) => Texture::embedded(image),
        Err(err) => {
            log::warn!("texture {index} could not be decoded: {err:#}");
            Texture {
                source: TextureSource::Embedded,
                image: None,
                gpu: None,
            }
        }
    }
}

fn convert_material(material: &gltf::Material<'_>) -> Material {
    let mut converted = Material::named(material.name().unwrap_or("material"));
    let pbr = material.pbr_metallic_roughness();
    converted.base_color = Vec4::from_array(pbr.base_color_factor());
    let slots = [
        (
            TextureSlot::BaseColor,
            pbr.base_color_texture().map(|info| info.texture().index()),
        ),
        (
            TextureSlot::MetallicRoughness,
            pbr.metallic_roughness_texture()
                .map(|info| info.texture().index()),
        ),
        (
            TextureSlot::Normal,
            material.normal_texture().map(|info| info.texture().index()),
        ),
        (
            TextureSlot::Occlusion,
            material.occlusion_texture().map(|info| info.texture().index()),
        ),
        (
            TextureSlot::Emissive,
            material.emissive_texture().map(|info| info.texture().index()),
        ),
    ];
    for (slot, texture) in slots {
        converted.set_texture(slot, texture);
    }
    converted
}

fn convert_primitive(
    primitive: &gltf::Primitive<'_>,
    buffers: &[Vec<u8>],
    name: String,
) -> Result<Mesh> {
    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(Vec::as_slice));
    let positions: Vec<Vec3> = reader
        .read_positions()
        .ok_or_else(|| anyhow!("primitive of {name} has no POSITION attribute"))?
        .map(Vec3::from_array)
        .collect();
    let normals = reader
        .read_normals()
        .map(|iter| iter.map(Vec3::from_array).collect())
        .unwrap_or_default();
    let uvs = reader
        .read_tex_coords(0)
        .map(|iter| iter.into_f32().map(Vec2::from_array).collect())
        .unwrap_or_default();
    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..positions.len() as u32).collect(),
    };
    if indices.iter().any(|&i| i as usize >= positions.len()) {
        bail!("primitive of {name} has out of range indices");
    }

    let mut mesh = Mesh {
        name,
        positions,
        normals,
        uvs,
        indices,
        material: primitive.material().index(),
        gpu: None,
    };
    mesh.ensure_normals();
    Ok(mesh)
}

fn convert_node(node: &gltf::Node<'_>, primitives_of_mesh: &[Vec<usize>]) -> SceneNode {
    let matrix = Mat4::from_cols_array_2d(&node.transform().matrix());
    SceneNode {
        name: node
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("node-{}", node.index())),
        transform: Transform::from_matrix(matrix),
        meshes: node
            .mesh()
            .and_then(|mesh| primitives_of_mesh.get(mesh.index()))
            .cloned()
            .unwrap_or_default(),
        children: node
            .children()
            .map(|child| convert_node(&child, primitives_of_mesh))
            .collect(),
    }
}

/// Minimal glTF documents used by tests across the crate.
#[cfg(test)]
pub(crate) mod fixtures {
    use base64::Engine;

    fn triangle_buffer(scale: f32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for value in [0.0, 0.0, 0.0, scale, 0.0, 0.0, 0.0, scale, 0.0f32] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        for index in [0u16, 1, 2] {
            bytes.extend_from_slice(&index.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        bytes
    }

    fn document(buffer_uri: Option<&str>, scale: f32) -> String {
        let uri = buffer_uri
            .map(|uri| format!(r#","uri":"{uri}""#))
            .unwrap_or_default();
        format!(
            r#"{{"asset":{{"version":"2.0"}},"scene":0,"scenes":[{{"nodes":[0]}}],
"nodes":[{{"mesh":0,"rotation":[0,0.7071068,0,0.7071068]}}],
"meshes":[{{"primitives":[{{"attributes":{{"POSITION":0}},"indices":1}}]}}],
"buffers":[{{"byteLength":44{uri}}}],
"bufferViews":[{{"buffer":0,"byteOffset":0,"byteLength":36}},{{"buffer":0,"byteOffset":36,"byteLength":6}}],
"accessors":[{{"bufferView":0,"componentType":5126,"count":3,"type":"VEC3","min":[0,0,0],"max":[{scale},{scale},0]}},
{{"bufferView":1,"componentType":5123,"count":3,"type":"SCALAR"}}]}}"#
        )
    }

    /// A right triangle with legs of length `scale`, buffer embedded as a data URI.
    pub fn triangle_gltf(scale: f32) -> Vec<u8> {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(triangle_buffer(scale));
        document(
            Some(&format!("data:application/octet-stream;base64,{encoded}")),
            scale,
        )
        .into_bytes()
    }

    /// The same triangle with an external buffer named `buffer_uri`.
    pub fn triangle_gltf_external(buffer_uri: &str) -> (Vec<u8>, Vec<u8>) {
        (document(Some(buffer_uri), 1.0).into_bytes(), triangle_buffer(1.0))
    }

    /// The same triangle in a binary GLB container.
    pub fn triangle_glb(scale: f32) -> Vec<u8> {
        let mut json = document(None, scale).into_bytes();
        while json.len() % 4 != 0 {
            json.push(b' ');
        }
        let bin = triangle_buffer(scale);
        let total = 12 + 8 + json.len() + 8 + bin.len();
        let mut glb = Vec::with_capacity(total);
        glb.extend_from_slice(b"glTF");
        glb.extend_from_slice(&2u32.to_le_bytes());
        glb.extend_from_slice(&(total as u32).to_le_bytes());
        glb.extend_from_slice(&(json.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"JSON");
        glb.extend_from_slice(&json);
        glb.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        glb.extend_from_slice(b"BIN\0");
        glb.extend_from_slice(&bin);
        glb
    }
}
