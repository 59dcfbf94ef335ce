use bytemuck::{Pod, Zeroable};
use glam::Mat3;

use super::common::{DrawItem, FrameParams};

/// Floats per interleaved vertex: position, normal, uv.
pub(crate) const VERTEX_FLOATS: usize = 8;

/// Depth bias subtracted before the shadow comparison.
pub(crate) const SHADOW_BIAS: f32 = 0.005;

pub(crate) const SHADOW_MAP_SIZE: u32 = 2048;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct GlobalUniform {
    view_proj: [[f32; 4]; 4],
    light_view_proj: [[f32; 4]; 4],
    camera_position: [f32; 4],
    light_position: [f32; 4],
    light_color: [f32; 4],
    shadow: [f32; 4],
}

impl GlobalUniform {
    pub(crate) fn new(frame: &FrameParams, shadows: bool) -> Self {
        let light = &frame.light;
        Self {
            view_proj: frame.camera.view_proj.to_cols_array_2d(),
            light_view_proj: light.view_proj().to_cols_array_2d(),
            camera_position: frame.camera.position.extend(1.0).into(),
            light_position: light.position.extend(1.0).into(),
            light_color: light.color.extend(light.intensity).into(),
            shadow: [if shadows { 1.0 } else { 0.0 }, SHADOW_BIAS, 0.0, 0.0],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct ObjectConstants {
    model: [[f32; 4]; 4],
    normal: [[f32; 4]; 3],
    color: [f32; 4],
}

impl ObjectConstants {
    pub(crate) fn new(item: &DrawItem) -> Self {
        let normal = Mat3::from_mat4(item.model).inverse().transpose();
        Self {
            model: item.model.to_cols_array_2d(),
            normal: mat3_to_3x4(normal),
            color: item.color.into(),
        }
    }
}

fn mat3_to_3x4(matrix: Mat3) -> [[f32; 4]; 3] {
    let cols = matrix.to_cols_array();
    [
        [cols[0], cols[1], cols[2], 0.0],
        [cols[3], cols[4], cols[5], 0.0],
        [cols[6], cols[7], cols[8], 0.0],
    ]
}

pub(crate) const SHADER: &str = r#"
struct GlobalUniform {
    view_proj: mat4x4<f32>,
    light_view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    light_position: vec4<f32>,
    light_color: vec4<f32>,
    shadow: vec4<f32>,
}

struct ObjectConstants {
    model: mat4x4<f32>,
    normal: mat3x4<f32>,
    color: vec4<f32>,
}

@group(0) @binding(0)
var<uniform> globals: GlobalUniform;
@group(0) @binding(1)
var shadow_map: texture_depth_2d;
@group(0) @binding(2)
var shadow_sampler: sampler_comparison;

@group(1) @binding(0)
var<uniform> object: ObjectConstants;

@group(2) @binding(0)
var base_color_map: texture_2d<f32>;
@group(2) @binding(1)
var base_color_sampler: sampler;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) world_pos: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) light_space: vec4<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    let world_position = object.model * vec4<f32>(input.position, 1.0);
    out.position = globals.view_proj * world_position;
    out.world_pos = world_position.xyz;
    out.light_space = globals.light_view_proj * world_position;
    out.uv = input.uv;

    let world_normal = mat3x3<f32>(
        object.normal[0].xyz,
        object.normal[1].xyz,
        object.normal[2].xyz
    ) * input.normal;
    out.normal = normalize(world_normal);
    return out;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let light_dir = normalize(globals.light_position.xyz - input.world_pos);
    let normal = normalize(input.normal);
    let diffuse = max(dot(normal, light_dir), 0.0);

    let projected = input.light_space.xyz / input.light_space.w;
    let shadow_uv = vec2<f32>(projected.x * 0.5 + 0.5, 0.5 - projected.y * 0.5);
    let lit = textureSampleCompare(shadow_map, shadow_sampler, shadow_uv, projected.z - globals.shadow.y);
    let visibility = mix(1.0, lit, globals.shadow.x);

    let albedo = textureSample(base_color_map, base_color_sampler, input.uv) * object.color;
    let ambient = 0.3;
    let intensity = globals.light_color.w;
    let lit_color = (ambient + diffuse * intensity * visibility) * albedo.rgb * globals.light_color.xyz;
    return vec4<f32>(lit_color, albedo.a);
}
"#;

pub(crate) const SHADOW_SHADER: &str = r#"
struct GlobalUniform {
    view_proj: mat4x4<f32>,
    light_view_proj: mat4x4<f32>,
    camera_position: vec4<f32>,
    light_position: vec4<f32>,
    light_color: vec4<f32>,
    shadow: vec4<f32>,
}

struct ObjectConstants {
    model: mat4x4<f32>,
    normal: mat3x4<f32>,
    color: vec4<f32>,
}

@group(0) @binding(0)
var<uniform> globals: GlobalUniform;

@group(1) @binding(0)
var<uniform> object: ObjectConstants;

@vertex
fn vs_shadow(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return globals.light_view_proj * object.model * vec4<f32>(position, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sizes_match_shader_layout() {
        assert_eq!(std::mem::size_of::<GlobalUniform>(), 192);
        assert_eq!(std::mem::size_of::<ObjectConstants>(), 128);
    }
}
