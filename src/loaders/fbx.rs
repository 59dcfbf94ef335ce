//! Binary FBX (Kaydara) reader.
//!
//! Only the parts a viewer needs are interpreted: `Geometry` meshes,
//! `Model` nodes with their local transforms, `Material` diffuse colors and
//! `Texture` file references, all stitched together through the
//! `Connections` section. Texture paths resolve against the resource base
//! path the cascade sets to the directory of the model URL.

use std::collections::HashMap;
use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::ZlibDecoder;
use glam::{EulerRot, Quat, Vec2, Vec3, Vec4};

use super::{parse_error, FormatParser, ParseInput};
use crate::error::ParseError;
use crate::format::ModelFormat;
use crate::scene::{Material, Mesh, SceneGraph, SceneNode, Texture, TextureSlot, Transform};
use crate::transport::resolve_relative;

const MAGIC: &[u8] = b"Kaydara FBX Binary  \0";
const HEADER_LEN: usize = 27;
/// Deepest node nesting accepted; real exports stay far below this.
const MAX_DEPTH: usize = 256;
/// Largest decoded property array.
const MAX_ARRAY_BYTES: usize = 512 * 1024 * 1024;
/// Upper bound of the deflate expansion ratio.
const MAX_INFLATE_RATIO: usize = 1032;

#[derive(Debug, Clone, Copy, Default)]
pub struct FbxParser;

impl FormatParser for FbxParser {
    fn format(&self) -> ModelFormat {
        ModelFormat::Fbx
    }

    fn parse(&self, input: &ParseInput<'_>) -> Result<SceneGraph, ParseError> {
        read_document(input.bytes)
            .and_then(|nodes| build_scene(&nodes, input.resource_base))
            .map_err(|err| parse_error(ModelFormat::Fbx, err, input.bytes))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Property {
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Raw(Vec<u8>),
    BoolArray(Vec<bool>),
    I32Array(Vec<i32>),
    I64Array(Vec<i64>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
}

impl Property {
    fn as_i64(&self) -> Option<i64> {
        match *self {
            Property::I16(v) => Some(v.into()),
            Property::I32(v) => Some(v.into()),
            Property::I64(v) => Some(v),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match *self {
            Property::F32(v) => Some(v.into()),
            Property::F64(v) => Some(v),
            Property::I16(v) => Some(v.into()),
            Property::I32(v) => Some(v.into()),
            Property::I64(v) => Some(v as f64),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Property::String(s) => Some(s),
            _ => None,
        }
    }

    fn as_f64_array(&self) -> Option<Vec<f64>> {
        match self {
            Property::F64Array(v) => Some(v.clone()),
            Property::F32Array(v) => Some(v.iter().map(|&x| x.into()).collect()),
            _ => None,
        }
    }

    fn as_i32_array(&self) -> Option<&[i32]> {
        match self {
            Property::I32Array(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Node {
    name: String,
    properties: Vec<Property>,
    children: Vec<Node>,
}

impl Node {
    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    fn property(&self, index: usize) -> Option<&Property> {
        self.properties.get(index)
    }

    fn id(&self) -> Option<i64> {
        self.property(0).and_then(Property::as_i64)
    }

    /// Object names are stored as `Name\0\x01Class`.
    fn object_name(&self) -> String {
        self.property(1)
            .and_then(Property::as_str)
            .map(|name| name.split('\0').next().unwrap_or(name).to_string())
            .unwrap_or_default()
    }

    fn first_string(&self) -> Option<&str> {
        self.property(0).and_then(Property::as_str)
    }

    /// Looks up a `Properties70` entry (`P: "name", type, label, flags, values...`).
    fn p70(&self, name: &str) -> Option<&Node> {
        self.child("Properties70")?
            .children_named("P")
            .find(|p| p.first_string() == Some(name))
    }

    fn p70_vec3(&self, name: &str) -> Option<Vec3> {
        let p = self.p70(name)?;
        let component = |i: usize| p.property(i).and_then(Property::as_f64).map(|v| v as f32);
        Some(Vec3::new(component(4)?, component(5)?, component(6)?))
    }

    fn p70_f32(&self, name: &str) -> Option<f32> {
        self.p70(name)?
            .property(4)
            .and_then(Property::as_f64)
            .map(|v| v as f32)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    wide: bool,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| anyhow!("unexpected end of FBX data at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Offsets and counts are 64-bit from FBX 7.5 on.
    fn offset(&mut self) -> Result<u64> {
        if self.wide {
            Ok(u64::from_le_bytes(self.array()?))
        } else {
            Ok(self.u32()?.into())
        }
    }

    fn node(&mut self, depth: usize) -> Result<Option<Node>> {
        if depth > MAX_DEPTH {
            bail!("FBX nodes nested deeper than {MAX_DEPTH} levels");
        }
        let end_offset = self.offset()? as usize;
        let property_count = self.offset()?;
        let _property_list_len = self.offset()?;
        let name_len = self.u8()? as usize;
        if end_offset == 0 {
            return Ok(None);
        }
        if end_offset > self.bytes.len() || end_offset < self.pos {
            bail!("FBX node ends outside the file (offset {end_offset})");
        }
        let name = String::from_utf8_lossy(self.take(name_len)?).into_owned();
        let mut properties = Vec::with_capacity(property_count.min(64) as usize);
        for _ in 0..property_count {
            properties.push(self.property().with_context(|| format!("in node {name}"))?);
        }
        let mut children = Vec::new();
        while self.pos < end_offset {
            match self.node(depth + 1)? {
                Some(child) => children.push(child),
                None => break,
            }
        }
        self.pos = end_offset;
        Ok(Some(Node {
            name,
            properties,
            children,
        }))
    }

    fn property(&mut self) -> Result<Property> {
        let code = self.u8()?;
        Ok(match code {
            b'C' => Property::Bool(self.u8()? != 0),
            b'Y' => Property::I16(i16::from_le_bytes(self.array()?)),
            b'I' => Property::I32(i32::from_le_bytes(self.array()?)),
            b'L' => Property::I64(i64::from_le_bytes(self.array()?)),
            b'F' => Property::F32(f32::from_le_bytes(self.array()?)),
            b'D' => Property::F64(f64::from_le_bytes(self.array()?)),
            b'S' => {
                let len = self.u32()? as usize;
                Property::String(String::from_utf8_lossy(self.take(len)?).into_owned())
            }
            b'R' => {
                let len = self.u32()? as usize;
                Property::Raw(self.take(len)?.to_vec())
            }
            b'b' => Property::BoolArray(self.array_data(1)?.iter().map(|&b| b != 0).collect()),
            b'i' => Property::I32Array(decode_array(&self.array_data(4)?, i32::from_le_bytes)),
            b'l' => Property::I64Array(decode_array(&self.array_data(8)?, i64::from_le_bytes)),
            b'f' => Property::F32Array(decode_array(&self.array_data(4)?, f32::from_le_bytes)),
            b'd' => Property::F64Array(decode_array(&self.array_data(8)?, f64::from_le_bytes)),
            other => bail!("unknown FBX property type {:?}", other as char),
        })
    }

    fn array_data(&mut self, element_size: usize) -> Result<Vec<u8>> {
        let count = self.u32()? as usize;
        let encoding = self.u32()?;
        let compressed_len = self.u32()? as usize;
        let raw = self.take(compressed_len)?;
        let expected = count
            .checked_mul(element_size)
            .filter(|&len| len <= MAX_ARRAY_BYTES)
            .ok_or_else(|| anyhow!("FBX array of {count} elements is too large"))?;
        let data = match encoding {
            0 => raw.to_vec(),
            1 => {
                if expected > compressed_len.saturating_mul(MAX_INFLATE_RATIO) {
                    bail!("FBX array claims {expected} bytes from {compressed_len} compressed");
                }
                let mut inflated = Vec::new();
                inflated
                    .try_reserve_exact(expected)
                    .map_err(|_| anyhow!("FBX array of {expected} bytes does not fit in memory"))?;
                ZlibDecoder::new(raw)
                    .take(expected as u64)
                    .read_to_end(&mut inflated)
                    .context("corrupt compressed FBX array")?;
                inflated
            }
            other => bail!("unknown FBX array encoding {other}"),
        };
        if data.len() < expected {
            bail!("FBX array holds {} bytes, expected {expected}", data.len());
        }
        Ok(data)
    }
}

fn decode_array<T, const N: usize>(data: &[u8], convert: fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            convert(bytes)
        })
        .collect()
}

fn read_document(bytes: &[u8]) -> Result<Vec<Node>> {
    if !bytes.starts_with(MAGIC) {
        if bytes.starts_with(b"; FBX") {
            bail!("ASCII FBX files are not supported; export as binary FBX");
        }
        bail!("Unexpected FBX header; not a binary FBX file");
    }
    if bytes.len() < HEADER_LEN {
        bail!("FBX header is truncated");
    }
    let version = u32::from_le_bytes([bytes[23], bytes[24], bytes[25], bytes[26]]);
    log::debug!("FBX version {version}");
    let mut reader = Reader {
        bytes,
        pos: HEADER_LEN,
        wide: version >= 7500,
    };
    let mut nodes = Vec::new();
    while reader.pos < bytes.len() {
        match reader.node(0)? {
            Some(node) => nodes.push(node),
            None => break,
        }
    }
    Ok(nodes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mapping {
    ByPolygonVertex,
    ByControlPoint,
    ByPolygon,
    AllSame,
}

/// One per-vertex attribute layer (normals or UVs).
struct Layer {
    values: Vec<f64>,
    indices: Option<Vec<i32>>,
    mapping: Mapping,
    width: usize,
}

impl Layer {
    fn read(node: &Node, values_name: &str, index_name: &str, width: usize) -> Option<Self> {
        let values = node.child(values_name)?.property(0)?.as_f64_array()?;
        let mapping = match node
            .child("MappingInformationType")
            .and_then(Node::first_string)
            .unwrap_or("ByPolygonVertex")
        {
            "ByVertice" | "ByVertex" | "ByControlPoint" => Mapping::ByControlPoint,
            "ByPolygon" => Mapping::ByPolygon,
            "AllSame" => Mapping::AllSame,
            _ => Mapping::ByPolygonVertex,
        };
        let indexed = node
            .child("ReferenceInformationType")
            .and_then(Node::first_string)
            .is_some_and(|kind| kind == "IndexToDirect" || kind == "Index");
        let indices = indexed
            .then(|| {
                node.child(index_name)
                    .and_then(|n| n.property(0))
                    .and_then(Property::as_i32_array)
                    .map(<[i32]>::to_vec)
            })
            .flatten();
        Some(Self {
            values,
            indices,
            mapping,
            width,
        })
    }

    fn value(&self, polygon_vertex: usize, control_point: usize, polygon: usize) -> Option<&[f64]> {
        let slot = match self.mapping {
            Mapping::ByPolygonVertex => polygon_vertex,
            Mapping::ByControlPoint => control_point,
            Mapping::ByPolygon => polygon,
            Mapping::AllSame => 0,
        };
        let index = match &self.indices {
            Some(indices) => usize::try_from(*indices.get(slot)?).ok()?,
            None => slot,
        };
        self.values.get(index * self.width..(index + 1) * self.width)
    }
}

fn build_mesh(geometry: &Node) -> Result<Mesh> {
    let name = geometry.object_name();
    let vertices = geometry
        .child("Vertices")
        .and_then(|n| n.property(0))
        .and_then(Property::as_f64_array)
        .ok_or_else(|| anyhow!("geometry {name} has no vertices"))?;
    let polygon_indices = geometry
        .child("PolygonVertexIndex")
        .and_then(|n| n.property(0))
        .and_then(Property::as_i32_array)
        .ok_or_else(|| anyhow!("geometry {name} has no polygons"))?;
    let control_points: Vec<Vec3> = vertices
        .chunks_exact(3)
        .map(|c| Vec3::new(c[0] as f32, c[1] as f32, c[2] as f32))
        .collect();

    let normals = geometry
        .child("LayerElementNormal")
        .and_then(|layer| Layer::read(layer, "Normals", "NormalsIndex", 3));
    let uvs = geometry
        .child("LayerElementUV")
        .and_then(|layer| Layer::read(layer, "UV", "UVIndex", 2));

    let mut mesh = Mesh {
        name,
        ..Mesh::default()
    };
    let mut polygon: Vec<u32> = Vec::new();
    let mut polygon_number = 0;
    for (polygon_vertex, &raw) in polygon_indices.iter().enumerate() {
        // The last index of each polygon is stored as its bitwise complement.
        let (control_point, closes) = if raw < 0 { (!raw, true) } else { (raw, false) };
        let control_point = usize::try_from(control_point)
            .ok()
            .filter(|&i| i < control_points.len())
            .ok_or_else(|| anyhow!("polygon index {control_point} out of range"))?;

        polygon.push(mesh.positions.len() as u32);
        mesh.positions.push(control_points[control_point]);
        let normal = normals
            .as_ref()
            .and_then(|layer| layer.value(polygon_vertex, control_point, polygon_number))
            .map(|n| Vec3::new(n[0] as f32, n[1] as f32, n[2] as f32))
            .unwrap_or(Vec3::ZERO);
        mesh.normals.push(normal);
        if let Some(layer) = &uvs {
            let uv = layer
                .value(polygon_vertex, control_point, polygon_number)
                .map(|uv| Vec2::new(uv[0] as f32, 1.0 - uv[1] as f32))
                .unwrap_or(Vec2::ZERO);
            mesh.uvs.push(uv);
        }

        if closes {
            for i in 1..polygon.len().saturating_sub(1) {
                mesh.indices
                    .extend_from_slice(&[polygon[0], polygon[i], polygon[i + 1]]);
            }
            polygon.clear();
            polygon_number += 1;
        }
    }
    mesh.ensure_normals();
    Ok(mesh)
}

fn model_transform(model: &Node) -> Transform {
    let translation = model.p70_vec3("Lcl Translation").unwrap_or(Vec3::ZERO);
    let rotation = model.p70_vec3("Lcl Rotation").unwrap_or(Vec3::ZERO);
    let pre_rotation = model.p70_vec3("PreRotation").unwrap_or(Vec3::ZERO);
    let scale = model.p70_vec3("Lcl Scaling").unwrap_or(Vec3::ONE);
    let euler = |degrees: Vec3| {
        Quat::from_euler(
            EulerRot::ZYX,
            degrees.z.to_radians(),
            degrees.y.to_radians(),
            degrees.x.to_radians(),
        )
    };
    Transform {
        translation,
        rotation: euler(pre_rotation) * euler(rotation),
        scale,
    }
}

fn material_slot(property: &str) -> Option<TextureSlot> {
    match property {
        "DiffuseColor" | "Diffuse" | "Maya|baseColor" => Some(TextureSlot::BaseColor),
        "NormalMap" => Some(TextureSlot::Normal),
        "Bump" | "BumpFactor" => Some(TextureSlot::Bump),
        "SpecularColor" | "SpecularFactor" => Some(TextureSlot::Specular),
        "EmissiveColor" | "EmissiveFactor" => Some(TextureSlot::Emissive),
        "TransparentColor" | "TransparencyFactor" => Some(TextureSlot::Alpha),
        "AmbientColor" => Some(TextureSlot::Occlusion),
        "ReflectionFactor" | "ShininessExponent" => Some(TextureSlot::MetallicRoughness),
        _ => None,
    }
}

fn build_scene(nodes: &[Node], resource_base: &str) -> Result<SceneGraph> {
    let objects = nodes
        .iter()
        .find(|node| node.name == "Objects")
        .ok_or_else(|| anyhow!("FBX file has no Objects section"))?;

    let mut scene = SceneGraph::default();
    let mut geometry_meshes: HashMap<i64, usize> = HashMap::new();
    let mut material_ids: HashMap<i64, usize> = HashMap::new();
    let mut texture_ids: HashMap<i64, usize> = HashMap::new();
    let mut models: HashMap<i64, &Node> = HashMap::new();
    let mut model_order = Vec::new();

    for object in &objects.children {
        let Some(id) = object.id() else {
            continue;
        };
        match object.name.as_str() {
            "Geometry" if object.property(2).and_then(Property::as_str) == Some("Mesh") => {
                let mesh = build_mesh(object)?;
                geometry_meshes.insert(id, scene.meshes.len());
                scene.meshes.push(mesh);
            }
            "Model" => {
                models.insert(id, object);
                model_order.push(id);
            }
            "Material" => {
                let mut material = Material::named(object.object_name());
                if let Some(color) = object.p70_vec3("DiffuseColor") {
                    let opacity = object.p70_f32("Opacity").unwrap_or(1.0);
                    material.base_color = Vec4::new(color.x, color.y, color.z, opacity);
                }
                material_ids.insert(id, scene.materials.len());
                scene.materials.push(material);
            }
            "Texture" => {
                let file = ["RelativeFilename", "FileName"]
                    .into_iter()
                    .filter_map(|name| object.child(name).and_then(Node::first_string))
                    .find(|file| !file.is_empty());
                if let Some(file) = file {
                    let uri = resolve_relative(resource_base, &file.replace('\\', "/"));
                    texture_ids.insert(id, scene.textures.len());
                    scene.textures.push(Texture::external(uri));
                }
            }
            _ => {}
        }
    }

    if scene.meshes.is_empty() {
        bail!("FBX file contains no mesh geometry");
    }

    let mut parent_of: HashMap<i64, i64> = HashMap::new();
    let mut model_meshes: HashMap<i64, Vec<usize>> = HashMap::new();
    let mut model_materials: HashMap<i64, Vec<usize>> = HashMap::new();
    let mut connected_geometry = vec![false; scene.meshes.len()];

    let connections = nodes.iter().find(|node| node.name == "Connections");
    for connection in connections.into_iter().flat_map(|c| c.children_named("C")) {
        let kind = connection.first_string().unwrap_or_default();
        let (Some(child), Some(parent)) = (
            connection.property(1).and_then(Property::as_i64),
            connection.property(2).and_then(Property::as_i64),
        ) else {
            continue;
        };
        if let Some(&mesh) = geometry_meshes.get(&child) {
            if models.contains_key(&parent) {
                model_meshes.entry(parent).or_default().push(mesh);
                connected_geometry[mesh] = true;
            }
        } else if let Some(&material) = material_ids.get(&child) {
            if models.contains_key(&parent) {
                model_materials.entry(parent).or_default().push(material);
            }
        } else if let Some(&texture) = texture_ids.get(&child) {
            if let Some(&material) = material_ids.get(&parent) {
                let property = connection.property(3).and_then(Property::as_str);
                let slot = match kind {
                    "OP" => property.and_then(material_slot),
                    _ => Some(TextureSlot::BaseColor),
                };
                if let Some(slot) = slot {
                    scene.materials[material].set_texture(slot, Some(texture));
                }
            }
        } else if models.contains_key(&child) {
            parent_of.insert(child, parent);
        }
    }

    for (model, meshes) in &model_meshes {
        let materials = model_materials.get(model);
        for &mesh in meshes {
            if scene.meshes[mesh].material.is_none() {
                scene.meshes[mesh].material = materials.and_then(|m| m.first().copied());
            }
        }
    }

    let mut children_of: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut top_level = Vec::new();
    for &id in &model_order {
        match parent_of.get(&id) {
            Some(parent) if models.contains_key(parent) => {
                children_of.entry(*parent).or_default().push(id)
            }
            _ => top_level.push(id),
        }
    }

    fn assemble(
        id: i64,
        models: &HashMap<i64, &Node>,
        children_of: &HashMap<i64, Vec<i64>>,
        model_meshes: &HashMap<i64, Vec<usize>>,
        depth: usize,
    ) -> SceneNode {
        let model = models[&id];
        let children = if depth > 256 {
            Vec::new()
        } else {
            children_of
                .get(&id)
                .map(|ids| {
                    ids.iter()
                        .map(|&child| assemble(child, models, children_of, model_meshes, depth + 1))
                        .collect()
                })
                .unwrap_or_default()
        };
        SceneNode {
            name: model.object_name(),
            transform: model_transform(model),
            meshes: model_meshes.get(&id).cloned().unwrap_or_default(),
            children,
        }
    }

    scene.root = SceneNode::named("root");
    for id in top_level {
        let node = assemble(id, &models, &children_of, &model_meshes, 0);
        scene.root.children.push(node);
    }
    // Geometry with no owning model still gets displayed.
    for (mesh, connected) in connected_geometry.into_iter().enumerate() {
        if !connected {
            scene.root.meshes.push(mesh);
        }
    }
    Ok(scene)
}

/// Writes minimal binary FBX documents for tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    pub enum Prop<'a> {
        I64(i64),
        F64(f64),
        Str(&'a str),
        F64s(&'a [f64]),
        I32s(&'a [i32]),
        ZippedF64s(&'a [f64]),
        /// Array record with a hand-written header.
        Array {
            code: u8,
            count: u32,
            encoding: u32,
            data: &'a [u8],
        },
    }

    pub struct Rec<'a> {
        pub name: &'a str,
        pub props: Vec<Prop<'a>>,
        pub children: Vec<Rec<'a>>,
    }

    pub fn rec<'a>(name: &'a str, props: Vec<Prop<'a>>, children: Vec<Rec<'a>>) -> Rec<'a> {
        Rec {
            name,
            props,
            children,
        }
    }

    fn encode_prop(prop: &Prop<'_>, out: &mut Vec<u8>) {
        match prop {
            Prop::I64(v) => {
                out.push(b'L');
                out.extend_from_slice(&v.to_le_bytes());
            }
            Prop::F64(v) => {
                out.push(b'D');
                out.extend_from_slice(&v.to_le_bytes());
            }
            Prop::Str(s) => {
                out.push(b'S');
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Prop::F64s(values) => {
                out.push(b'd');
                let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                out.extend_from_slice(&(values.len() as u32).to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(&data);
            }
            Prop::I32s(values) => {
                out.push(b'i');
                let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                out.extend_from_slice(&(values.len() as u32).to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(&data);
            }
            Prop::ZippedF64s(values) => {
                out.push(b'd');
                let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&data).unwrap();
                let zipped = encoder.finish().unwrap();
                out.extend_from_slice(&(values.len() as u32).to_le_bytes());
                out.extend_from_slice(&1u32.to_le_bytes());
                out.extend_from_slice(&(zipped.len() as u32).to_le_bytes());
                out.extend_from_slice(&zipped);
            }
            Prop::Array {
                code,
                count,
                encoding,
                data,
            } => {
                out.push(*code);
                out.extend_from_slice(&count.to_le_bytes());
                out.extend_from_slice(&encoding.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
        }
    }

    pub fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn encode_node(node: &Rec<'_>, out: &mut Vec<u8>) {
        let start = out.len();
        let mut props = Vec::new();
        for prop in &node.props {
            encode_prop(prop, &mut props);
        }
        out.extend_from_slice(&[0u8; 12]);
        out.push(node.name.len() as u8);
        out.extend_from_slice(node.name.as_bytes());
        out.extend_from_slice(&props);
        if !node.children.is_empty() {
            for child in &node.children {
                encode_node(child, out);
            }
            out.extend_from_slice(&[0u8; 13]);
        }
        let end = out.len() as u32;
        out[start..start + 4].copy_from_slice(&end.to_le_bytes());
        out[start + 4..start + 8].copy_from_slice(&(node.props.len() as u32).to_le_bytes());
        out[start + 8..start + 12].copy_from_slice(&(props.len() as u32).to_le_bytes());
    }

    /// Encodes a version 7400 document (32-bit offsets).
    pub fn document(nodes: &[Rec<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(super::MAGIC);
        out.extend_from_slice(&[0x1a, 0x00]);
        out.extend_from_slice(&7400u32.to_le_bytes());
        for node in nodes {
            encode_node(node, &mut out);
        }
        out.extend_from_slice(&[0u8; 13]);
        out
    }

    /// A unit quad under one model with a textured material, in centimetres
    /// scaled by `size`.
    pub fn textured_quad(size: f64) -> Vec<u8> {
        let s = size;
        let vertices = [0.0, 0.0, 0.0, s, 0.0, 0.0, s, s, 0.0, 0.0, s, 0.0];
        document(&[
            rec(
                "Objects",
                vec![],
                vec![
                    rec(
                        "Geometry",
                        vec![Prop::I64(10), Prop::Str("Quad\0\x01Geometry"), Prop::Str("Mesh")],
                        vec![
                            rec("Vertices", vec![Prop::ZippedF64s(&vertices)], vec![]),
                            rec("PolygonVertexIndex", vec![Prop::I32s(&[0, 1, 2, -4])], vec![]),
                            rec(
                                "LayerElementNormal",
                                vec![],
                                vec![
                                    rec("MappingInformationType", vec![Prop::Str("ByControlPoint")], vec![]),
                                    rec("ReferenceInformationType", vec![Prop::Str("Direct")], vec![]),
                                    rec(
                                        "Normals",
                                        vec![Prop::F64s(&[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0])],
                                        vec![],
                                    ),
                                ],
                            ),
                        ],
                    ),
                    rec(
                        "Model",
                        vec![Prop::I64(20), Prop::Str("Quad\0\x01Model"), Prop::Str("Mesh")],
                        vec![rec(
                            "Properties70",
                            vec![],
                            vec![rec(
                                "P",
                                vec![
                                    Prop::Str("Lcl Rotation"),
                                    Prop::Str("Lcl Rotation"),
                                    Prop::Str(""),
                                    Prop::Str("A"),
                                    Prop::F64(-90.0),
                                    Prop::F64(0.0),
                                    Prop::F64(0.0),
                                ],
                                vec![],
                            )],
                        )],
                    ),
                    rec(
                        "Material",
                        vec![Prop::I64(30), Prop::Str("Paint\0\x01Material"), Prop::Str("")],
                        vec![rec(
                            "Properties70",
                            vec![],
                            vec![rec(
                                "P",
                                vec![
                                    Prop::Str("DiffuseColor"),
                                    Prop::Str("Color"),
                                    Prop::Str(""),
                                    Prop::Str("A"),
                                    Prop::F64(1.0),
                                    Prop::F64(0.5),
                                    Prop::F64(0.0),
                                ],
                                vec![],
                            )],
                        )],
                    ),
                    rec(
                        "Texture",
                        vec![Prop::I64(40), Prop::Str("Wood\0\x01Texture"), Prop::Str("")],
                        vec![rec("RelativeFilename", vec![Prop::Str("textures\\wood.png")], vec![])],
                    ),
                ],
            ),
            rec(
                "Connections",
                vec![],
                vec![
                    rec("C", vec![Prop::Str("OO"), Prop::I64(20), Prop::I64(0)], vec![]),
                    rec("C", vec![Prop::Str("OO"), Prop::I64(10), Prop::I64(20)], vec![]),
                    rec("C", vec![Prop::Str("OO"), Prop::I64(30), Prop::I64(20)], vec![]),
                    rec(
                        "C",
                        vec![Prop::Str("OP"), Prop::I64(40), Prop::I64(30), Prop::Str("DiffuseColor")],
                        vec![],
                    ),
                ],
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn parse(bytes: &[u8]) -> Result<SceneGraph, ParseError> {
        FbxParser.parse(&ParseInput {
            url: "https://host/models/a/model.fbx",
            bytes,
            resource_base: "https://host/models/a/",
            resources: &HashMap::new(),
        })
    }

    #[test]
    fn reads_geometry_models_materials_and_textures() {
        let scene = parse(&textured_quad(200.0)).unwrap();
        assert_eq!(scene.meshes.len(), 1);
        assert_eq!(scene.triangle_count(), 2);
        assert_eq!(scene.root.children.len(), 1);
        let model = &scene.root.children[0];
        assert_eq!(model.name, "Quad");
        assert_eq!(model.meshes, vec![0]);
        assert!(model.transform.rotation.angle_between(Quat::IDENTITY) > 1.5);

        let material = &scene.materials[scene.meshes[0].material.unwrap()];
        assert_eq!(material.name, "Paint");
        assert_eq!(material.base_color, Vec4::new(1.0, 0.5, 0.0, 1.0));
        let texture = material.texture(TextureSlot::BaseColor).unwrap();
        assert_eq!(
            scene.textures[texture],
            Texture::external("https://host/models/a/textures/wood.png")
        );

        let bounds = scene.world_bounds().unwrap();
        assert!((bounds.max_dimension() - 200.0).abs() < 1e-3);
    }

    #[test]
    fn gltf_bytes_are_rejected_with_preview() {
        let err = parse(b"glTF\x02\x00\x00\x00").unwrap_err();
        assert!(err.to_string().contains("Unexpected FBX header"));
        assert!(err.to_string().contains("leading bytes: \"glTF"));
    }

    #[test]
    fn truncated_document_is_an_error() {
        let bytes = textured_quad(1.0);
        assert!(parse(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn oversized_array_header_is_a_parse_error() {
        let empty = zlib(&[]);
        let bytes = document(&[rec(
            "Objects",
            vec![],
            vec![rec(
                "Vertices",
                vec![Prop::Array {
                    code: b'd',
                    count: u32::MAX,
                    encoding: 1,
                    data: &empty,
                }],
                vec![],
            )],
        )]);
        let err = parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
    }

    #[test]
    fn compressed_array_must_fit_its_inflate_ratio() {
        let zipped = zlib(&[0u8; 64]);
        let bytes = document(&[rec(
            "Vertices",
            vec![Prop::Array {
                code: b'd',
                count: 10_000_000,
                encoding: 1,
                data: &zipped,
            }],
            vec![],
        )]);
        let err = parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("compressed"), "{err}");
    }

    #[test]
    fn short_compressed_array_is_rejected() {
        let zipped = zlib(&[0u8; 16]);
        let bytes = document(&[rec(
            "Vertices",
            vec![Prop::Array {
                code: b'd',
                count: 4,
                encoding: 1,
                data: &zipped,
            }],
            vec![],
        )]);
        let err = parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("expected 32"), "{err}");
    }

    #[test]
    fn runaway_nesting_is_a_parse_error() {
        let mut node = rec("Leaf", vec![Prop::I64(1)], vec![]);
        for _ in 0..MAX_DEPTH + 10 {
            node = rec("Nest", vec![], vec![node]);
        }
        let err = parse(&document(&[node])).unwrap_err();
        assert!(err.to_string().contains("nested deeper"), "{err}");
    }
}
