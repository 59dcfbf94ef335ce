use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use glam::{Vec2, Vec3};

use super::{parse_error, FormatParser, ParseInput};
use crate::error::ParseError;
use crate::format::ModelFormat;
use crate::scene::{Material, Mesh, SceneGraph, SceneNode, Texture, TextureSlot};
use crate::transport::resolve_relative;

/// Wavefront OBJ with optional MTL material libraries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjParser;

impl FormatParser for ObjParser {
    fn format(&self) -> ModelFormat {
        ModelFormat::Obj
    }

    fn dependencies(&self, bytes: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(bytes)
            .lines()
            .filter_map(|line| line.trim().strip_prefix("mtllib"))
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .map(|rest| rest.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()
    }

    fn parse(&self, input: &ParseInput<'_>) -> Result<SceneGraph, ParseError> {
        load_obj(input).map_err(|err| parse_error(ModelFormat::Obj, err, input.bytes))
    }
}

fn load_obj(input: &ParseInput<'_>) -> Result<SceneGraph> {
    let data = std::str::from_utf8(input.bytes).context("OBJ file is not valid UTF-8")?;

    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut uvs = Vec::new();
    let mut groups: Vec<Group> = vec![Group::default()];
    let mut library = MaterialLibrary::default();

    for (line_no, line) in data.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let Some(tag) = parts.next() else {
            continue;
        };
        match tag {
            "v" => positions.push(
                parse_vec3(parts)
                    .with_context(|| format!("invalid vertex on line {}", line_no + 1))?,
            ),
            "vn" => normals.push(
                parse_vec3(parts)
                    .with_context(|| format!("invalid normal on line {}", line_no + 1))?,
            ),
            "vt" => uvs.push(
                parse_uv(parts)
                    .with_context(|| format!("invalid texture coordinate on line {}", line_no + 1))?,
            ),
            "f" => {
                let polygon = parse_face(parts)
                    .with_context(|| format!("invalid face on line {}", line_no + 1))?;
                current(&mut groups).triangulate(&polygon);
            }
            "o" | "g" => {
                let name = parts.collect::<Vec<_>>().join(" ");
                let material = current(&mut groups).material.clone();
                start_group(&mut groups, name, material);
            }
            "usemtl" => {
                let material = parts.collect::<Vec<_>>().join(" ");
                let name = current(&mut groups).name.clone();
                start_group(&mut groups, name, Some(material));
            }
            "mtllib" => {
                let name = parts.collect::<Vec<_>>().join(" ");
                match input.resource(&name) {
                    Some(bytes) => library.parse(&String::from_utf8_lossy(bytes), input.resource_base),
                    None => log::warn!("material library {name} is unavailable"),
                }
            }
            _ => {}
        }
    }

    if positions.is_empty() {
        return Err(anyhow!("OBJ file does not define any vertices"));
    }

    let mut scene = SceneGraph {
        root: SceneNode::named("root"),
        textures: library.textures,
        ..SceneGraph::default()
    };
    let mut material_index: HashMap<String, usize> = HashMap::new();
    for group in groups.into_iter().filter(|group| !group.faces.is_empty()) {
        let material = group.material.as_ref().map(|name| {
            *material_index.entry(name.clone()).or_insert_with(|| {
                scene.materials.push(
                    library
                        .materials
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| Material::named(name.clone())),
                );
                scene.materials.len() - 1
            })
        });
        let mut mesh = build_mesh(&group, &positions, &normals, &uvs)?;
        mesh.material = material;
        mesh.ensure_normals();
        scene.root.meshes.push(scene.meshes.len());
        scene.meshes.push(mesh);
    }

    if scene.meshes.is_empty() {
        return Err(anyhow!("OBJ file does not define any faces"));
    }
    Ok(scene)
}

#[derive(Debug, Default)]
struct Group {
    name: String,
    material: Option<String>,
    faces: Vec<[FaceIndex; 3]>,
}

impl Group {
    fn triangulate(&mut self, polygon: &[FaceIndex]) {
        if polygon.len() < 3 {
            return;
        }
        for i in 1..(polygon.len() - 1) {
            self.faces.push([polygon[0], polygon[i], polygon[i + 1]]);
        }
    }
}

fn current(groups: &mut Vec<Group>) -> &mut Group {
    if groups.is_empty() {
        groups.push(Group::default());
    }
    let last = groups.len() - 1;
    &mut groups[last]
}

fn start_group(groups: &mut Vec<Group>, name: String, material: Option<String>) {
    let group = current(groups);
    if group.faces.is_empty() {
        group.name = name;
        group.material = material;
    } else {
        groups.push(Group {
            name,
            material,
            faces: Vec::new(),
        });
    }
}

fn parse_vec3<'a>(mut parts: impl Iterator<Item = &'a str>) -> Result<Vec3> {
    let mut next = || -> Result<f32> {
        Ok(parts
            .next()
            .ok_or_else(|| anyhow!("missing vector component"))?
            .parse::<f32>()?)
    };
    Ok(Vec3::new(next()?, next()?, next()?))
}

fn parse_uv<'a>(mut parts: impl Iterator<Item = &'a str>) -> Result<Vec2> {
    let u = parts
        .next()
        .ok_or_else(|| anyhow!("missing texture coordinate"))?
        .parse::<f32>()?;
    let v = parts.next().map(str::parse::<f32>).transpose()?.unwrap_or(0.0);
    Ok(Vec2::new(u, v))
}

fn parse_face<'a>(parts: impl Iterator<Item = &'a str>) -> Result<Vec<FaceIndex>> {
    let mut indices = Vec::new();
    for part in parts {
        let mut segments = part.split('/');
        let v = segments
            .next()
            .ok_or_else(|| anyhow!("missing vertex index"))?
            .parse::<i32>()?;
        let mut optional = || -> i32 {
            segments
                .next()
                .filter(|s| !s.is_empty())
                .and_then(|s| s.parse::<i32>().ok())
                .unwrap_or(0)
        };
        let vt = optional();
        let vn = optional();
        indices.push(FaceIndex { v, vt, vn });
    }
    if indices.len() < 3 {
        return Err(anyhow!("faces must reference at least 3 vertices"));
    }
    Ok(indices)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    position: usize,
    uv: Option<usize>,
    normal: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct FaceIndex {
    v: i32,
    vt: i32,
    vn: i32,
}

fn build_mesh(group: &Group, positions: &[Vec3], normals: &[Vec3], uvs: &[Vec2]) -> Result<Mesh> {
    let mut lookup: HashMap<Key, u32> = HashMap::new();
    let mut mesh = Mesh {
        name: if group.name.is_empty() {
            "default".to_string()
        } else {
            group.name.clone()
        },
        ..Mesh::default()
    };
    let has_uvs = !uvs.is_empty();

    for face in &group.faces {
        for idx in face {
            let position =
                fix_index(idx.v, positions.len()).ok_or_else(|| anyhow!("invalid vertex index"))?;
            let key = Key {
                position,
                uv: fix_index(idx.vt, uvs.len()),
                normal: fix_index(idx.vn, normals.len()),
            };
            let next_index = mesh.positions.len() as u32;
            let entry = lookup.entry(key).or_insert_with(|| {
                mesh.positions.push(positions[position]);
                mesh.normals
                    .push(key.normal.map(|i| normals[i]).unwrap_or(Vec3::ZERO));
                if has_uvs {
                    mesh.uvs.push(key.uv.map(|i| uvs[i]).unwrap_or(Vec2::ZERO));
                }
                next_index
            });
            mesh.indices.push(*entry);
        }
    }

    Ok(mesh)
}

fn fix_index(index: i32, len: usize) -> Option<usize> {
    if index > 0 {
        let zero_based = index as usize - 1;
        (zero_based < len).then_some(zero_based)
    } else if index < 0 {
        let abs = index.unsigned_abs() as usize;
        (abs <= len).then_some(len - abs)
    } else {
        None
    }
}

/// Materials and textures declared by `.mtl` files.
#[derive(Debug, Default)]
struct MaterialLibrary {
    materials: HashMap<String, Material>,
    textures: Vec<Texture>,
    texture_index: HashMap<String, usize>,
}

impl MaterialLibrary {
    fn parse(&mut self, text: &str, base: &str) {
        let mut current: Option<String> = None;
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (tag, rest) = trimmed
                .split_once(char::is_whitespace)
                .map(|(tag, rest)| (tag, rest.trim()))
                .unwrap_or((trimmed, ""));
            if tag == "newmtl" {
                self.materials
                    .insert(rest.to_string(), Material::named(rest));
                current = Some(rest.to_string());
                continue;
            }
            let Some(material) = current.as_ref().and_then(|name| self.materials.get_mut(name))
            else {
                continue;
            };
            match tag {
                "Kd" => {
                    if let Ok(color) = parse_vec3(rest.split_whitespace()) {
                        let alpha = material.base_color.w;
                        material.base_color = color.extend(alpha);
                    }
                }
                "d" => {
                    if let Ok(alpha) = rest.parse::<f32>() {
                        material.base_color.w = alpha.clamp(0.0, 1.0);
                    }
                }
                "Tr" => {
                    if let Ok(transparency) = rest.parse::<f32>() {
                        material.base_color.w = (1.0 - transparency).clamp(0.0, 1.0);
                    }
                }
                _ => {
                    let Some(slot) = texture_slot(tag) else {
                        continue;
                    };
                    // Options such as `-bm 1.0` precede the file name.
                    let Some(file) = rest.split_whitespace().last() else {
                        continue;
                    };
                    let uri = resolve_relative(base, file);
                    let next = self.textures.len();
                    let index = *self.texture_index.entry(uri.clone()).or_insert(next);
                    if index == next {
                        self.textures.push(Texture::external(uri));
                    }
                    let material = current
                        .as_ref()
                        .and_then(|name| self.materials.get_mut(name));
                    if let Some(material) = material {
                        material.set_texture(slot, Some(index));
                    }
                }
            }
        }
    }
}

fn texture_slot(tag: &str) -> Option<TextureSlot> {
    match tag {
        "map_Kd" => Some(TextureSlot::BaseColor),
        "map_Ks" => Some(TextureSlot::Specular),
        "map_Ke" => Some(TextureSlot::Emissive),
        "map_Ka" | "map_ao" => Some(TextureSlot::Occlusion),
        "map_Bump" | "map_bump" | "bump" => Some(TextureSlot::Bump),
        "norm" | "map_Kn" => Some(TextureSlot::Normal),
        "map_d" => Some(TextureSlot::Alpha),
        "map_Pr" | "map_Pm" => Some(TextureSlot::MetallicRoughness),
        _ => None,
    }
}
