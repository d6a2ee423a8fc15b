use std::sync::Arc;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
    keyboard::{PhysicalKey, KeyCode as WinitKeyCode},
};

use glam::{EulerRot, Mat4, Quat, Vec2, Vec3, Vec4};
use bytemuck::{Pod, Zeroable};
use bitflags::bitflags;
use rand::{Rng, SeedableRng, rngs::StdRng};
use wgpu::util::DeviceExt;

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

// === CONSTANTS ===
const DIMX: u32 = 1080;
const DIMY: u32 = 720;
const TARGET_FPS: f32 = 512.0; // Stable Native Top End. Web is capped by rAF.
const FRAME_TIME: f32 = 1.0 / TARGET_FPS;
// PICK ONE LOGGING OPTION ONLY. DOUBLE FALSE SHOWS NOTHING.
const MINIMAL_LOGGING: bool = true;   // Show only FPS
const LOGGING_ENABLED: bool = false;  // Enable detailed logging system
const STATS_UPDATE_INTERVAL: f32 = 0.75;

// Tunnel cross-section and recycling
const BOX_WIDTH: f32 = 8.0;
const BOX_HEIGHT: f32 = 6.0;
const BOX_DEPTH: f32 = 50.0;
const WALL_THICKNESS: f32 = 0.6;
const PARTICLES_PER_FIELD: usize = 2500;
const FIELD_SEED_A: u64 = 0x5eed_0001;
const FIELD_SEED_B: u64 = 0x5eed_0002;
const CULL_MAX_ATTEMPTS: u32 = 16;

// Beam / volumetric kernel
const BEAM_FAR: f32 = 1.0e6; // no-intersection sentinel, >= any plausible ray length
const BEAM_MAX_SAMPLES: u32 = 256;
const CONE_DENOM_EPSILON: f32 = 1.0e-6;
const MIN_RAY_LENGTH: f32 = 1.0e-4;

// Noise assets
const NOISE_SIZE: u32 = 128;
const BLUE_NOISE_SIZE: u32 = 64;
const TURB_NOISE_SEED: u64 = 0x70_c3;
const TURB_NOISE_OCTAVES: u32 = 3;

// Camera
const CAMERA_FOV: f32 = 60.0;
const CAMERA_NEAR: f32 = 0.1;
const CAMERA_FAR: f32 = 120.0;
const CAMERA_SWAY_AMPLITUDE: f32 = 0.35;
const CAMERA_SWAY_SPEED: f32 = 0.4;

// Tuning steps
const HALF_ANGLE_STEP: f32 = 2.0;
const DENSITY_STEP: f32 = 0.1;
const SPEED_STEP: f32 = 2.0;
const ATTENUATION_STEP: f32 = 0.005;
const DECAY_STEP: f32 = 0.01;
const WEIGHT_STEP: f32 = 0.002;

// ====================
// === INPUT SYSTEM ===
// ====================

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InputFlags: u32 {
        const P = 1 << 0;
        const V = 1 << 1;
        const B = 1 << 2;
        const R = 1 << 3;
        const G = 1 << 4;
        const L = 1 << 5;
        const Q = 1 << 6;
        const E = 1 << 7;
        const W = 1 << 8;
        const S = 1 << 9;
        const A = 1 << 10;
        const D = 1 << 11;
        const ESC = 1 << 12;
        const DIGIT1 = 1 << 13;
        const DIGIT2 = 1 << 14;
        const ARROW_UP = 1 << 15;
        const ARROW_DOWN = 1 << 16;
        const ARROW_LEFT = 1 << 17;
        const ARROW_RIGHT = 1 << 18;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const RUNNING = 1 << 0;
        const PAUSED = 1 << 1;
        const SHOULD_EXIT = 1 << 2;
        const RADIAL_SCATTER = 1 << 3;
        const SCATTER_BLUR = 1 << 4;
        const LIGHT_SWAY = 1 << 5;
        const REGEN_FIELDS = 1 << 6;
    }
}

// ======================================
// === SHADER DATA STRUCTURES ===
// ======================================

// Scene pass uniforms. Segment offsets ride along so the vertex shader can
// translate instances without a per-frame instance buffer rewrite.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct SceneUniforms {
    view_proj: [[f32; 4]; 4],
    camera_position: [f32; 3],
    time: f32,
    cone_apex: [f32; 3],
    cos_half_angle: f32,
    cone_axis: [f32; 3],
    attenuation_k: f32,
    beam_color: [f32; 3],
    _pad0: f32,
    segment_offsets: [f32; 2],
    segment_split: u32,
    frame_index: u32,
}

// Full ray-march kernel uniforms. Kept strictly separate from the radial
// scatter uniforms; the two kernels never share a buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct BeamUniforms {
    inv_proj: [[f32; 4]; 4],
    inv_view: [[f32; 4]; 4],
    cone_apex: [f32; 3],
    cos_half_angle: f32,
    cone_axis: [f32; 3],
    attenuation_k: f32,
    beam_color: [f32; 3],
    density: f32,
    camera_position: [f32; 3],
    sample_count: u32,
    frame_index: u32,
    time: f32,
    _pad0: [f32; 2],
}

// Radial scatter kernel uniforms.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable, PartialEq)]
pub struct ScatterUniforms {
    light_screen_pos: [f32; 2],
    sample_count: u32,
    decay: f32,
    weight: f32,
    exposure: f32,
    density: f32,
    blur_enabled: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    normal: [f32; 3],
    uv: [f32; 2],
}

impl Vertex {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 3]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x3,
                },
                wgpu::VertexAttribute {
                    offset: (std::mem::size_of::<[f32; 3]>() * 2) as wgpu::BufferAddress,
                    shader_location: 2,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

// Per-instance data: model matrix columns plus linear RGB color.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct ParticleInstanceRaw {
    model_matrix: [[f32; 4]; 4],
    color: [f32; 4],
}

impl ParticleInstanceRaw {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<ParticleInstanceRaw>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 3,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 4]>() as wgpu::BufferAddress,
                    shader_location: 4,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: (std::mem::size_of::<[f32; 4]>() * 2) as wgpu::BufferAddress,
                    shader_location: 5,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: (std::mem::size_of::<[f32; 4]>() * 3) as wgpu::BufferAddress,
                    shader_location: 6,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: (std::mem::size_of::<[f32; 4]>() * 4) as wgpu::BufferAddress,
                    shader_location: 7,
                    format: wgpu::VertexFormat::Float32x4,
                },
            ],
        }
    }
}

// ======================================
// === TUNING CONFIG ===
// ======================================

/// Runtime-adjustable parameters. Every mutation goes through a clamped
/// setter so the per-pixel kernels only ever see in-range values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningConfig {
    pub half_angle_deg: f32,
    pub attenuation_k: f32,
    pub beam_density: f32,
    pub sample_count: u32,
    pub recycler_speed: f32,
    pub scatter_decay: f32,
    pub scatter_weight: f32,
    pub scatter_exposure: f32,
    pub scatter_density: f32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            half_angle_deg: 24.0,
            attenuation_k: 0.02,
            beam_density: 1.1,
            sample_count: 100,
            recycler_speed: 9.0,
            scatter_decay: 0.96,
            scatter_weight: 0.02,
            scatter_exposure: 0.45,
            scatter_density: 0.9,
        }
    }
}

impl TuningConfig {
    pub fn set_half_angle_deg(&mut self, v: f32) {
        // Never exactly 0 or 90: both degenerate the intersector.
        self.half_angle_deg = v.clamp(0.5, 89.0);
    }

    pub fn set_attenuation_k(&mut self, v: f32) {
        self.attenuation_k = v.clamp(0.0, 1.0);
    }

    pub fn set_beam_density(&mut self, v: f32) {
        self.beam_density = v.clamp(0.0, 8.0);
    }

    pub fn set_sample_count(&mut self, v: i64) {
        self.sample_count = v.clamp(1, BEAM_MAX_SAMPLES as i64) as u32;
    }

    pub fn set_recycler_speed(&mut self, v: f32) {
        self.recycler_speed = v.clamp(0.0, 60.0);
    }

    pub fn set_scatter_decay(&mut self, v: f32) {
        self.scatter_decay = v.clamp(0.0, 0.999);
    }

    pub fn set_scatter_weight(&mut self, v: f32) {
        self.scatter_weight = v.clamp(0.0, 0.2);
    }

    pub fn set_scatter_exposure(&mut self, v: f32) {
        self.scatter_exposure = v.clamp(0.0, 4.0);
    }

    pub fn set_scatter_density(&mut self, v: f32) {
        self.scatter_density = v.clamp(0.0, 2.0);
    }

    pub fn cos_half_angle(&self) -> f32 {
        self.half_angle_deg.to_radians().cos()
    }
}

// ======================================
// === NOISE ASSETS ===
// ======================================

/// A square tileable scalar field, addressed with wrap-around bilinear
/// sampling. CPU-side twin of the GPU noise textures; the reference kernel
/// and the tests read this, the shaders read the uploaded texture.
pub struct NoiseField {
    pub size: u32,
    pub data: Vec<f32>,
}

impl NoiseField {
    /// Neutral field: sampling anywhere yields 1.0, so a missing asset
    /// degrades to "no turbulence" instead of faulting.
    pub fn neutral() -> Self {
        Self { size: 1, data: vec![1.0] }
    }

    /// Tileable multi-octave value noise, normalized to [0,1].
    pub fn value_noise(size: u32, seed: u64, octaves: u32) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let lattice_base: u32 = 8;
        let n = (size * size) as usize;
        let mut data = vec![0.0f32; n];
        let mut amplitude = 1.0f32;
        let mut total = 0.0f32;

        for octave in 0..octaves {
            let lattice = lattice_base << octave;
            let grid: Vec<f32> = (0..(lattice * lattice)).map(|_| rng.r#gen::<f32>()).collect();
            for y in 0..size {
                for x in 0..size {
                    let fx = x as f32 / size as f32 * lattice as f32;
                    let fy = y as f32 / size as f32 * lattice as f32;
                    let x0 = fx.floor() as u32 % lattice;
                    let y0 = fy.floor() as u32 % lattice;
                    let x1 = (x0 + 1) % lattice;
                    let y1 = (y0 + 1) % lattice;
                    let tx = smoothstep(fx.fract());
                    let ty = smoothstep(fy.fract());
                    let g = |xx: u32, yy: u32| grid[(yy * lattice + xx) as usize];
                    let a = lerp(g(x0, y0), g(x1, y0), tx);
                    let b = lerp(g(x0, y1), g(x1, y1), tx);
                    data[(y * size + x) as usize] += lerp(a, b, ty) * amplitude;
                }
            }
            total += amplitude;
            amplitude *= 0.5;
        }

        for v in &mut data {
            *v /= total;
        }
        Self { size, data }
    }

    /// Interleaved gradient noise: cheap stand-in for a blue noise tile,
    /// high-frequency and low-autocorrelation, which is all the dither
    /// jitter needs.
    pub fn interleaved_gradient(size: u32) -> Self {
        let mut data = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                let v = (52.9829189 * (0.06711056 * x as f32 + 0.00583715 * y as f32).fract()).fract();
                data.push(v);
            }
        }
        Self { size, data }
    }

    /// Raw 8-bit grayscale file, size*size bytes. Any failure falls back to
    /// the provided generator and logs a warning once.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn from_raw_file_or(path: &str, size: u32, fallback: impl FnOnce() -> Self) -> Self {
        match std::fs::read(path) {
            Ok(bytes) if bytes.len() == (size * size) as usize => {
                let data = bytes.iter().map(|&b| b as f32 / 255.0).collect();
                Self { size, data }
            }
            Ok(bytes) => {
                log::warn!(
                    "noise asset {} has {} bytes, expected {}; using procedural fallback",
                    path, bytes.len(), size * size
                );
                fallback()
            }
            Err(e) => {
                log::warn!("noise asset {} unavailable ({}); using procedural fallback", path, e);
                fallback()
            }
        }
    }

    /// Bilinear wrap-around sample, u/v in tile units (any real value).
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        let s = self.size as f32;
        let fx = (u.rem_euclid(1.0)) * s;
        let fy = (v.rem_euclid(1.0)) * s;
        let x0 = fx.floor() as u32 % self.size;
        let y0 = fy.floor() as u32 % self.size;
        let x1 = (x0 + 1) % self.size;
        let y1 = (y0 + 1) % self.size;
        let tx = fx.fract();
        let ty = fy.fract();
        let g = |x: u32, y: u32| self.data[(y * self.size + x) as usize];
        let a = lerp(g(x0, y0), g(x1, y0), tx);
        let b = lerp(g(x0, y1), g(x1, y1), tx);
        lerp(a, b, ty)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.data.iter().map(|&v| (v.clamp(0.0, 1.0) * 255.0) as u8).collect()
    }
}

#[inline(always)]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline(always)]
fn smoothstep(t: f32) -> f32 {
    t * t * (3.0 - 2.0 * t)
}

// ======================================
// === PARTICLE FIELD GENERATOR ===
// ======================================

/// One scattered piece of wall debris. Immutable once generated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticleInstance {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: f32,
    pub color: Vec3,
}

impl ParticleInstance {
    pub fn to_raw(&self) -> ParticleInstanceRaw {
        let model = Mat4::from_scale_rotation_translation(
            Vec3::splat(self.scale),
            Quat::from_euler(EulerRot::XYZ, self.rotation.x, self.rotation.y, self.rotation.z),
            self.position,
        );
        ParticleInstanceRaw {
            model_matrix: model.to_cols_array_2d(),
            color: [self.color.x, self.color.y, self.color.z, 1.0],
        }
    }
}

/// Generation parameters for one particle field batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldParams {
    pub capacity: usize,
    pub box_width: f32,
    pub box_height: f32,
    pub box_depth: f32,
    pub wall_thickness: f32,
    pub size_randomness: f32,
    pub rotation_randomness: f32,
    pub base_rotation: Vec3,
    pub base_color: Vec3,
    pub color_randomness: f32,
    /// 0 disables the thinning pass. Above 0, candidate positions whose
    /// noise sample falls below the threshold are redrawn (bounded attempts)
    /// so the batch still comes back at full capacity.
    pub noise_threshold: f32,
}

impl Default for FieldParams {
    fn default() -> Self {
        Self {
            capacity: PARTICLES_PER_FIELD,
            box_width: BOX_WIDTH,
            box_height: BOX_HEIGHT,
            box_depth: BOX_DEPTH,
            wall_thickness: WALL_THICKNESS,
            size_randomness: 0.6,
            rotation_randomness: 1.0,
            base_rotation: Vec3::ZERO,
            base_color: Vec3::new(0.55, 0.52, 0.48),
            color_randomness: 0.25,
            noise_threshold: 0.0,
        }
    }
}

/// Which of the four cross-section faces an instance landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Face {
    Top,
    Bottom,
    Left,
    Right,
}

/// Classify a position against the four face planes; None if it sits on no
/// wall (should never happen for generated instances).
pub fn face_of(p: Vec3, params: &FieldParams) -> Option<Face> {
    let half_t = params.wall_thickness * 0.5;
    let hw = params.box_width * 0.5;
    let hh = params.box_height * 0.5;
    if (p.y - hh).abs() <= half_t {
        Some(Face::Top)
    } else if (p.y + hh).abs() <= half_t {
        Some(Face::Bottom)
    } else if (p.x + hw).abs() <= half_t {
        Some(Face::Left)
    } else if (p.x - hw).abs() <= half_t {
        Some(Face::Right)
    } else {
        None
    }
}

fn draw_candidate(params: &FieldParams, rng: &mut StdRng) -> Vec3 {
    let hw = params.box_width * 0.5;
    let hh = params.box_height * 0.5;
    let half_t = params.wall_thickness * 0.5;
    let z = rng.gen_range(-params.box_depth * 0.5..params.box_depth * 0.5);
    match rng.gen_range(0..4u32) {
        0 => {
            // Top: in-plane x, out-of-plane y around +height/2
            let x = rng.gen_range(-hw..hw);
            let y = hh + rng.gen_range(-half_t..half_t);
            Vec3::new(x, y, z)
        }
        1 => {
            let x = rng.gen_range(-hw..hw);
            let y = -hh + rng.gen_range(-half_t..half_t);
            Vec3::new(x, y, z)
        }
        2 => {
            let y = rng.gen_range(-hh..hh);
            let x = -hw + rng.gen_range(-half_t..half_t);
            Vec3::new(x, y, z)
        }
        _ => {
            let y = rng.gen_range(-hh..hh);
            let x = hw + rng.gen_range(-half_t..half_t);
            Vec3::new(x, y, z)
        }
    }
}

fn field_noise_uv(p: Vec3, params: &FieldParams) -> (f32, f32) {
    (
        p.z / params.box_depth + 0.5,
        (p.x + p.y) / (params.box_width + params.box_height) + 0.5,
    )
}

/// Generate a full batch of instances scattered over the four inner faces.
/// Deterministic for a given seed state; the RNG is injected, never ambient.
pub fn generate_field(params: &FieldParams, noise: &NoiseField, rng: &mut StdRng) -> Vec<ParticleInstance> {
    let mut out = Vec::with_capacity(params.capacity);
    for _ in 0..params.capacity {
        let mut position = draw_candidate(params, rng);
        if params.noise_threshold > 0.0 {
            // Rejection sampling against the noise field thins the walls into
            // patterned clumps. Capacity is preserved: after the attempt
            // budget the last candidate is accepted unconditionally.
            for _ in 0..CULL_MAX_ATTEMPTS {
                let (u, v) = field_noise_uv(position, params);
                if noise.sample(u, v) >= params.noise_threshold {
                    break;
                }
                position = draw_candidate(params, rng);
            }
        }

        let scale = 1.0 - params.size_randomness + rng.r#gen::<f32>() * 2.0 * params.size_randomness;
        let rot = |base: f32, rng: &mut StdRng| {
            base + (rng.r#gen::<f32>() * 2.0 - 1.0) * params.rotation_randomness * std::f32::consts::PI
        };
        let rotation = Vec3::new(
            rot(params.base_rotation.x, rng),
            rot(params.base_rotation.y, rng),
            rot(params.base_rotation.z, rng),
        );
        let color = if params.color_randomness > 0.0 {
            jitter_color(params.base_color, params.color_randomness, rng)
        } else {
            params.base_color
        };

        out.push(ParticleInstance { position, rotation, scale, color });
    }
    out
}

fn jitter_color(base: Vec3, amount: f32, rng: &mut StdRng) -> Vec3 {
    let (h, s, l) = rgb_to_hsl(base);
    let shift = |rng: &mut StdRng| (rng.r#gen::<f32>() - 0.5) * 2.0 * amount;
    let h = (h + shift(rng)).rem_euclid(1.0);
    let s = (s + shift(rng)).clamp(0.0, 1.0);
    let l = (l + shift(rng)).clamp(0.0, 1.0);
    hsl_to_rgb(h, s, l)
}

pub fn rgb_to_hsl(c: Vec3) -> (f32, f32, f32) {
    let max = c.x.max(c.y).max(c.z);
    let min = c.x.min(c.y).min(c.z);
    let l = (max + min) * 0.5;
    if (max - min).abs() < 1.0e-6 {
        return (0.0, 0.0, l);
    }
    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };
    let h = if max == c.x {
        ((c.y - c.z) / d + if c.y < c.z { 6.0 } else { 0.0 }) / 6.0
    } else if max == c.y {
        ((c.z - c.x) / d + 2.0) / 6.0
    } else {
        ((c.x - c.y) / d + 4.0) / 6.0
    };
    (h, s, l)
}

pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> Vec3 {
    if s < 1.0e-6 {
        return Vec3::splat(l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    let hue = |t: f32| {
        let t = t.rem_euclid(1.0);
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    };
    Vec3::new(hue(h + 1.0 / 3.0), hue(h), hue(h - 1.0 / 3.0))
}

// ======================================
// === TUNNEL RECYCLER ===
// ======================================

/// One of the two particle batches sliding along the travel axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunnelSegment {
    pub offset: f32,
}

/// Wrap into [-1.5*depth, 0.5*depth). The camera looks down -z, so the
/// window is biased ahead of it: a segment teleports a full period forward
/// only once it has slid completely behind the view, and the corridor ahead
/// never covers less than one full box depth. rem_euclid keeps the pair's
/// exact one-depth separation no matter how large a single step is.
#[inline(always)]
pub fn wrap_offset(offset: f32, box_depth: f32) -> f32 {
    (offset + 1.5 * box_depth).rem_euclid(2.0 * box_depth) - 1.5 * box_depth
}

/// Advance both segments by speed*dt and rewrap. The pair starts one full
/// box depth apart, so the corridor stays gap-free and overlap-free forever.
pub fn advance_segments(a: &mut TunnelSegment, b: &mut TunnelSegment, speed: f32, dt: f32, box_depth: f32) {
    let step = speed * dt;
    a.offset = wrap_offset(a.offset + step, box_depth);
    b.offset = wrap_offset(b.offset + step, box_depth);
}

// ======================================
// === DEPTH-TO-WORLD RECONSTRUCTION ===
// ======================================

/// Reconstruct the world-space point behind a pixel. `ndc` is the screen
/// coordinate in [-1,1] on both axes; `depth` is the raw depth sample in the
/// same convention the projection writes (0..1 clip z for perspective_rh).
/// Feeding a depth from a mismatched projection silently reconstructs the
/// wrong point, which is why the round-trip property test exists.
pub fn world_from_depth(ndc: Vec2, depth: f32, inv_proj: Mat4, inv_view: Mat4) -> Vec3 {
    let clip = Vec4::new(ndc.x, ndc.y, depth, 1.0);
    let view = inv_proj * clip;
    let view = view / view.w;
    (inv_view * Vec4::new(view.x, view.y, view.z, 1.0)).truncate()
}

// ======================================
// === RAY-CONE INTERSECTION ===
// ======================================

/// Entry distance of a ray into a one-sided cone, or BEAM_FAR when there is
/// no usable entry. Single-nappe linearized form: with the origin inside the
/// cone's angular wedge (b > 0) and a direction leaving it (a < 0) the
/// crossing sits at -b/a. Every other sign combination is treated as no
/// intersection, including near-parallel directions where the denominator
/// degenerates.
pub fn ray_cone_entry(origin: Vec3, dir: Vec3, apex: Vec3, axis: Vec3, cos_half_angle: f32) -> f32 {
    let rel = origin - apex;
    let a = dir.dot(axis) - cos_half_angle * dir.length();
    let b = rel.dot(axis) - cos_half_angle * rel.length();
    if a < -CONE_DENOM_EPSILON && b > 0.0 {
        -b / a
    } else {
        BEAM_FAR
    }
}

// ======================================
// === CPU REFERENCE KERNELS ===
// ======================================
// The shaders are the production path; these functions are the same math on
// the CPU so the transport behavior is testable without a GPU.

#[derive(Debug, Clone, Copy)]
pub struct BeamParams {
    pub apex: Vec3,
    pub axis: Vec3,
    pub cos_half_angle: f32,
    pub attenuation_k: f32,
    pub density: f32,
    pub sample_count: u32,
}

/// Accumulated in-beam density along the camera ray toward `surface_point`
/// (the depth-reconstructed world position bounding the march).
pub fn march_beam(
    camera: Vec3,
    surface_point: Vec3,
    params: &BeamParams,
    turbulence: &NoiseField,
    jitter01: f32,
    time: f32,
) -> f32 {
    let ray = surface_point - camera;
    let ray_length = ray.length();
    if ray_length < MIN_RAY_LENGTH || params.sample_count == 0 {
        return 0.0;
    }
    let dir = ray / ray_length;

    let entry = ray_cone_entry(camera, dir, params.apex, params.axis, params.cos_half_angle);
    if entry >= ray_length || entry >= BEAM_FAR {
        return 0.0;
    }

    let step = ray_length / params.sample_count as f32;
    let mut t = jitter01.clamp(0.0, 1.0) * step;
    let mut density = 0.0f32;
    for _ in 0..params.sample_count {
        if t > ray_length {
            break;
        }
        let p = camera + dir * t;
        let to_apex = params.apex - p;
        let dist = to_apex.length();
        if dist > 1.0e-4 {
            let cos_angle = (to_apex / dist).dot(-params.axis);
            if cos_angle > params.cos_half_angle {
                let attenuation = 1.0 / (1.0 + dist * dist * params.attenuation_k);
                let axis_w = (cos_angle - params.cos_half_angle) / (1.0 - params.cos_half_angle);
                let axis_w = axis_w * axis_w;
                // Two taps at different spatial frequencies break the beam
                // into drifting streaks.
                let n1 = turbulence.sample(p.x * 0.05 + time * 0.010, p.z * 0.05);
                let n2 = turbulence.sample(p.y * 0.21 - time * 0.023, p.z * 0.17);
                density += attenuation * axis_w * (n1 * n2) * params.density * step;
            }
        }
        t += step;
    }
    density
}

#[derive(Debug, Clone, Copy)]
pub struct ScatterParams {
    pub sample_count: u32,
    pub decay: f32,
    pub weight: f32,
    pub exposure: f32,
    pub density: f32,
}

/// Radial scatter over an already-rendered frame: walk from the pixel toward
/// the light's screen position accumulating decayed taps. `sample` is the
/// color buffer lookup (clamped addressing is the caller's concern).
pub fn radial_scatter<F: Fn(Vec2) -> Vec3>(
    sample: F,
    uv: Vec2,
    light_uv: Vec2,
    params: &ScatterParams,
) -> Vec3 {
    if params.sample_count == 0 {
        return Vec3::ZERO;
    }
    let delta = (uv - light_uv) * (params.density / params.sample_count as f32);
    let mut coord = uv;
    let mut illumination_decay = 1.0f32;
    let mut acc = Vec3::ZERO;
    for _ in 0..params.sample_count {
        coord -= delta;
        acc += sample(coord) * illumination_decay * params.weight;
        illumination_decay *= params.decay;
    }
    acc * params.exposure
}

// ============================
// === SHADER SOURCES ===
// ============================
// WGSL render shaders don't need explicit padding fields beyond what the
// Rust structs already carry; uniform struct layouts below mirror the
// #[repr(C)] definitions field for field.

fn generate_scene_shader() -> String {
    format!(r#"
    struct SceneUniforms {{
        view_proj: mat4x4<f32>,
        camera_position: vec3<f32>,
        time: f32,
        cone_apex: vec3<f32>,
        cos_half_angle: f32,
        cone_axis: vec3<f32>,
        attenuation_k: f32,
        beam_color: vec3<f32>,
        _pad0: f32,
        segment_offsets: vec2<f32>,
        segment_split: u32,
        frame_index: u32,
    }}

    struct VertexInput {{
        @location(0) position: vec3<f32>,
        @location(1) normal: vec3<f32>,
        @location(2) uv: vec2<f32>,
    }}

    struct InstanceInput {{
        @location(3) model_0: vec4<f32>,
        @location(4) model_1: vec4<f32>,
        @location(5) model_2: vec4<f32>,
        @location(6) model_3: vec4<f32>,
        @location(7) color: vec4<f32>,
    }}

    struct VertexOutput {{
        @builtin(position) clip_position: vec4<f32>,
        @location(0) world_pos: vec3<f32>,
        @location(1) normal: vec3<f32>,
        @location(2) color: vec3<f32>,
    }}

    @group(0) @binding(0) var<uniform> uniforms: SceneUniforms;

    @vertex
    fn vs_main(
        vertex: VertexInput,
        instance: InstanceInput,
        @builtin(instance_index) instance_idx: u32,
    ) -> VertexOutput {{
        let model = mat4x4<f32>(instance.model_0, instance.model_1, instance.model_2, instance.model_3);
        var world = model * vec4<f32>(vertex.position, 1.0);

        // Segment recycling: the first half of the instance range belongs to
        // segment A, the rest to segment B; each rides its own travel offset.
        var offset = uniforms.segment_offsets.x;
        if (instance_idx >= uniforms.segment_split) {{
            offset = uniforms.segment_offsets.y;
        }}
        world.z += offset;

        var out: VertexOutput;
        out.clip_position = uniforms.view_proj * world;
        out.world_pos = world.xyz;
        // Uniform per-instance scale, so the model matrix rotates normals safely.
        out.normal = normalize((model * vec4<f32>(vertex.normal, 0.0)).xyz);
        out.color = instance.color.rgb;
        return out;
    }}

    @fragment
    fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {{
        let n = normalize(in.normal);
        let to_light = uniforms.cone_apex - in.world_pos;
        let dist = max(length(to_light), 0.0001);
        let l = to_light / dist;

        let diffuse = max(dot(n, l), 0.0);
        // Spot factor: only surfaces inside the cone pick up the beam color.
        let cos_angle = dot(-l, uniforms.cone_axis);
        let spot = clamp(
            (cos_angle - uniforms.cos_half_angle) / max(1.0 - uniforms.cos_half_angle, 0.0001),
            0.0, 1.0
        );
        let attenuation = 1.0 / (1.0 + dist * dist * uniforms.attenuation_k);

        let ambient = vec3<f32>(0.05);
        let lit = ambient + uniforms.beam_color * diffuse * spot * attenuation * 3.0;
        return vec4<f32>(in.color * lit, 1.0);
    }}
    "#)
}

fn generate_beam_shader() -> String {
    format!(r#"
    const BEAM_FAR: f32 = {beam_far:.1};
    const CONE_DENOM_EPSILON: f32 = {denom_eps:e};
    const MIN_RAY_LENGTH: f32 = {min_ray:e};

    struct BeamUniforms {{
        inv_proj: mat4x4<f32>,
        inv_view: mat4x4<f32>,
        cone_apex: vec3<f32>,
        cos_half_angle: f32,
        cone_axis: vec3<f32>,
        attenuation_k: f32,
        beam_color: vec3<f32>,
        density: f32,
        camera_position: vec3<f32>,
        sample_count: u32,
        frame_index: u32,
        time: f32,
        _pad0: vec2<f32>,
    }}

    struct VertexOutput {{
        @builtin(position) clip_position: vec4<f32>,
        @location(0) uv: vec2<f32>,
        @location(1) ndc: vec2<f32>,
    }}

    @group(0) @binding(0) var<uniform> bu: BeamUniforms;
    @group(0) @binding(1) var scene_color: texture_2d<f32>;
    @group(0) @binding(2) var scene_depth: texture_depth_2d;
    @group(0) @binding(3) var blue_noise: texture_2d<f32>;
    @group(0) @binding(4) var turb_noise: texture_2d<f32>;
    @group(0) @binding(5) var clamp_sampler: sampler;
    @group(0) @binding(6) var wrap_sampler: sampler;

    fn world_from_depth(ndc: vec2<f32>, depth: f32) -> vec3<f32> {{
        let clip = vec4<f32>(ndc, depth, 1.0);
        var view = bu.inv_proj * clip;
        view = view / view.w;
        return (bu.inv_view * vec4<f32>(view.xyz, 1.0)).xyz;
    }}

    fn ray_cone_entry(origin: vec3<f32>, dir: vec3<f32>) -> f32 {{
        let rel = origin - bu.cone_apex;
        let a = dot(dir, bu.cone_axis) - bu.cos_half_angle * length(dir);
        let b = dot(rel, bu.cone_axis) - bu.cos_half_angle * length(rel);
        if (a < -CONE_DENOM_EPSILON && b > 0.0) {{
            return -b / a;
        }}
        return BEAM_FAR;
    }}

    fn aces_tonemap(color: vec3<f32>) -> vec3<f32> {{
        let a = 2.51;
        let b = 0.03;
        let c = 2.43;
        let d = 0.59;
        let e = 0.14;
        return (color * (a * color + b)) / (color * (c * color + d) + e);
    }}

    @vertex
    fn vs_main(
        @location(0) position: vec3<f32>,
        @location(1) normal: vec3<f32>,
        @location(2) uv: vec2<f32>,
    ) -> VertexOutput {{
        var out: VertexOutput;
        out.clip_position = vec4<f32>(position.xy, 0.0, 1.0);
        out.ndc = position.xy;
        out.uv = vec2<f32>(position.x * 0.5 + 0.5, 0.5 - position.y * 0.5);
        return out;
    }}

    @fragment
    fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {{
        let frag = vec2<i32>(in.clip_position.xy);
        let depth = textureLoad(scene_depth, frag, 0);
        var color = textureSampleLevel(scene_color, clamp_sampler, in.uv, 0.0).rgb;

        let world = world_from_depth(in.ndc, depth);
        let ray = world - bu.camera_position;
        let ray_length = length(ray);

        if (ray_length >= MIN_RAY_LENGTH && bu.sample_count > 0u) {{
            let dir = ray / ray_length;
            let entry = ray_cone_entry(bu.camera_position, dir);

            if (entry < ray_length && entry < BEAM_FAR) {{
                // Blue-noise start jitter, re-keyed every frame so the dither
                // pattern decorrelates over time instead of banding.
                let frame = f32(bu.frame_index % 64u);
                let jitter = textureSampleLevel(
                    blue_noise, wrap_sampler,
                    in.uv * 8.0 + vec2<f32>(frame * 0.0718, frame * 0.1531),
                    0.0
                ).r;

                let step_len = ray_length / f32(bu.sample_count);
                var t = jitter * step_len;
                var density = 0.0;

                for (var i = 0u; i < bu.sample_count; i++) {{
                    if (t > ray_length) {{
                        break;
                    }}
                    let p = bu.camera_position + dir * t;
                    let to_apex = bu.cone_apex - p;
                    let dist = length(to_apex);
                    if (dist > 0.0001) {{
                        let cos_angle = dot(to_apex / dist, -bu.cone_axis);
                        if (cos_angle > bu.cos_half_angle) {{
                            let attenuation = 1.0 / (1.0 + dist * dist * bu.attenuation_k);
                            var axis_w = (cos_angle - bu.cos_half_angle) / (1.0 - bu.cos_half_angle);
                            axis_w = axis_w * axis_w;
                            let n1 = textureSampleLevel(turb_noise, wrap_sampler,
                                vec2<f32>(p.x * 0.05 + bu.time * 0.010, p.z * 0.05), 0.0).r;
                            let n2 = textureSampleLevel(turb_noise, wrap_sampler,
                                vec2<f32>(p.y * 0.21 - bu.time * 0.023, p.z * 0.17), 0.0).r;
                            density += attenuation * axis_w * (n1 * n2) * bu.density * step_len;
                        }}
                    }}
                    t += step_len;
                }}

                color += density * bu.beam_color;
            }}
        }}

        let mapped = aces_tonemap(color);
        let final_color = pow(mapped, vec3<f32>(1.0 / 2.2));
        return vec4<f32>(final_color, 1.0);
    }}
    "#,
        beam_far = BEAM_FAR,
        denom_eps = CONE_DENOM_EPSILON,
        min_ray = MIN_RAY_LENGTH,
    )
}

fn generate_scatter_shader() -> String {
    format!(r#"
    struct ScatterUniforms {{
        light_screen_pos: vec2<f32>,
        sample_count: u32,
        decay: f32,
        weight: f32,
        exposure: f32,
        density: f32,
        blur_enabled: u32,
    }}

    struct VertexOutput {{
        @builtin(position) clip_position: vec4<f32>,
        @location(0) uv: vec2<f32>,
    }}

    @group(0) @binding(0) var<uniform> su: ScatterUniforms;
    @group(0) @binding(1) var scene_color: texture_2d<f32>;
    @group(0) @binding(2) var clamp_sampler: sampler;

    fn tap(coord: vec2<f32>) -> vec3<f32> {{
        return textureSampleLevel(scene_color, clamp_sampler, coord, 0.0).rgb;
    }}

    fn blurred_tap(coord: vec2<f32>) -> vec3<f32> {{
        let texel = 1.0 / vec2<f32>(textureDimensions(scene_color));
        var s = tap(coord + vec2<f32>(texel.x, 0.0));
        s += tap(coord - vec2<f32>(texel.x, 0.0));
        s += tap(coord + vec2<f32>(0.0, texel.y));
        s += tap(coord - vec2<f32>(0.0, texel.y));
        return s * 0.25;
    }}

    fn aces_tonemap(color: vec3<f32>) -> vec3<f32> {{
        let a = 2.51;
        let b = 0.03;
        let c = 2.43;
        let d = 0.59;
        let e = 0.14;
        return (color * (a * color + b)) / (color * (c * color + d) + e);
    }}

    @vertex
    fn vs_main(
        @location(0) position: vec3<f32>,
        @location(1) normal: vec3<f32>,
        @location(2) uv: vec2<f32>,
    ) -> VertexOutput {{
        var out: VertexOutput;
        out.clip_position = vec4<f32>(position.xy, 0.0, 1.0);
        out.uv = vec2<f32>(position.x * 0.5 + 0.5, 0.5 - position.y * 0.5);
        return out;
    }}

    @fragment
    fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {{
        var color = tap(in.uv);

        if (su.sample_count > 0u && su.weight > 0.0) {{
            let delta = (in.uv - su.light_screen_pos) * (su.density / f32(su.sample_count));
            var coord = in.uv;
            var illumination_decay = 1.0;
            var acc = vec3<f32>(0.0);

            for (var i = 0u; i < su.sample_count; i++) {{
                coord -= delta;
                var s: vec3<f32>;
                if (su.blur_enabled == 1u) {{
                    s = blurred_tap(coord);
                }} else {{
                    s = tap(coord);
                }}
                acc += s * illumination_decay * su.weight;
                illumination_decay *= su.decay;
            }}

            color += acc * su.exposure;
        }}

        let mapped = aces_tonemap(color);
        let final_color = pow(mapped, vec3<f32>(1.0 / 2.2));
        return vec4<f32>(final_color, 1.0);
    }}
    "#)
}

// ======================================
// === CORE UNIFIED SYSTEM ===
// ======================================

pub struct EngineCore {
    pub tunnel: TunnelSystem,
    pub camera: CameraSystem,
    pub light: LightRig,
    pub tuning: TuningConfig,
    pub render: RenderSystem,
    pub beam: BeamSystem,
    pub input: InputSystem,
    pub timing: TimingSystem,
    pub state_flags: StateFlags,
    pub stats_accumulator: StatsAccumulator,
}

/// CPU-side owner of the two recycled particle batches.
pub struct TunnelSystem {
    pub params: FieldParams,
    pub segment_a: TunnelSegment,
    pub segment_b: TunnelSegment,
    pub field_a: Vec<ParticleInstance>,
    pub field_b: Vec<ParticleInstance>,
    pub turbulence: NoiseField,
    pub blue_noise: NoiseField,
    pub generation: u64,
}

impl TunnelSystem {
    pub fn new() -> Self {
        let params = FieldParams::default();

        #[cfg(not(target_arch = "wasm32"))]
        let turbulence = NoiseField::from_raw_file_or("assets/turbulence.raw", NOISE_SIZE, || {
            NoiseField::value_noise(NOISE_SIZE, TURB_NOISE_SEED, TURB_NOISE_OCTAVES)
        });
        #[cfg(target_arch = "wasm32")]
        let turbulence = NoiseField::value_noise(NOISE_SIZE, TURB_NOISE_SEED, TURB_NOISE_OCTAVES);

        #[cfg(not(target_arch = "wasm32"))]
        let blue_noise = NoiseField::from_raw_file_or("assets/blue_noise.raw", BLUE_NOISE_SIZE, || {
            NoiseField::interleaved_gradient(BLUE_NOISE_SIZE)
        });
        #[cfg(target_arch = "wasm32")]
        let blue_noise = NoiseField::interleaved_gradient(BLUE_NOISE_SIZE);

        let mut rng_a = StdRng::seed_from_u64(FIELD_SEED_A);
        let mut rng_b = StdRng::seed_from_u64(FIELD_SEED_B);
        let field_a = generate_field(&params, &turbulence, &mut rng_a);
        let field_b = generate_field(&params, &turbulence, &mut rng_b);

        Self {
            params,
            segment_a: TunnelSegment { offset: 0.0 },
            segment_b: TunnelSegment { offset: -BOX_DEPTH },
            field_a,
            field_b,
            turbulence,
            blue_noise,
            generation: 0,
        }
    }

    /// Rebuild both batches with fresh (but still explicit) seeds.
    pub fn regenerate(&mut self) {
        self.generation += 1;
        let mut rng_a = StdRng::seed_from_u64(FIELD_SEED_A.wrapping_add(self.generation));
        let mut rng_b = StdRng::seed_from_u64(FIELD_SEED_B.wrapping_add(self.generation));
        self.field_a = generate_field(&self.params, &self.turbulence, &mut rng_a);
        self.field_b = generate_field(&self.params, &self.turbulence, &mut rng_b);
    }

    pub fn advance(&mut self, speed: f32, dt: f32) {
        advance_segments(&mut self.segment_a, &mut self.segment_b, speed, dt, self.params.box_depth);
    }

    pub fn raw_instances(&self) -> Vec<ParticleInstanceRaw> {
        self.field_a.iter().chain(self.field_b.iter()).map(|p| p.to_raw()).collect()
    }
}

pub struct CameraSystem {
    pub position: Vec3,
    pub target: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub proj_matrix: Mat4,
    pub view_matrix: Mat4,
    pub view_proj_matrix: Mat4,
    pub inv_proj_matrix: Mat4,
    pub inv_view_matrix: Mat4,
}

impl CameraSystem {
    pub fn new() -> Self {
        let mut cam = Self {
            position: Vec3::new(0.0, -0.8, 0.0),
            target: Vec3::new(0.0, -0.6, -10.0),
            fov: CAMERA_FOV,
            aspect: DIMX as f32 / DIMY as f32,
            near: CAMERA_NEAR,
            far: CAMERA_FAR,
            proj_matrix: Mat4::IDENTITY,
            view_matrix: Mat4::IDENTITY,
            view_proj_matrix: Mat4::IDENTITY,
            inv_proj_matrix: Mat4::IDENTITY,
            inv_view_matrix: Mat4::IDENTITY,
        };
        cam.rebuild_matrices();
        cam
    }

    /// Gentle lateral drift so the flythrough doesn't read as a static lock.
    pub fn sway(&mut self, time: f32) {
        let sway = (time * CAMERA_SWAY_SPEED).sin() * CAMERA_SWAY_AMPLITUDE;
        self.position.x = sway;
        self.target.x = sway * 0.4;
        self.rebuild_matrices();
    }

    pub fn rebuild_matrices(&mut self) {
        self.proj_matrix = Mat4::perspective_rh(self.fov.to_radians(), self.aspect, self.near, self.far);
        self.view_matrix = Mat4::look_at_rh(self.position, self.target, Vec3::Y);
        self.view_proj_matrix = self.proj_matrix * self.view_matrix;
        self.inv_proj_matrix = self.proj_matrix.inverse();
        self.inv_view_matrix = self.view_matrix.inverse();
    }

    pub fn update_aspect_ratio(&mut self, aspect: f32) {
        self.aspect = aspect;
        self.rebuild_matrices();
    }
}

/// The single cone light. Mutated per frame by the sway animation and the
/// tuning input, read-only to both kernels.
pub struct LightRig {
    pub apex: Vec3,
    pub target: Vec3,
    pub color: Vec3,
}

impl LightRig {
    pub fn new() -> Self {
        Self {
            apex: Vec3::new(0.0, BOX_HEIGHT * 0.5 - 0.2, -10.0),
            target: Vec3::new(0.0, -BOX_HEIGHT * 0.5, -2.0),
            color: Vec3::new(1.0, 0.94, 0.78),
        }
    }

    pub fn axis(&self) -> Vec3 {
        (self.target - self.apex).normalize_or_zero()
    }

    pub fn sway(&mut self, time: f32) {
        self.apex.x = (time * 0.31).sin() * 1.4;
        self.target.x = (time * 0.31 + 0.6).sin() * 0.8;
    }

    /// Apex projected to normalized [0,1] screen coordinates for the radial
    /// scatter kernel, or None when the light sits behind the camera (the
    /// kernel is suppressed for that frame rather than fed garbage).
    pub fn screen_position(&self, view_proj: Mat4) -> Option<Vec2> {
        let clip = view_proj * Vec4::new(self.apex.x, self.apex.y, self.apex.z, 1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let ndc = Vec2::new(clip.x / clip.w, clip.y / clip.w);
        Some(Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5))
    }
}

pub struct RenderSystem {
    pub uniform_buffer: Option<wgpu::Buffer>,
    pub instance_buffer: Option<wgpu::Buffer>,
    pub scene_pipeline: Option<wgpu::RenderPipeline>,
    pub bind_group: Option<wgpu::BindGroup>,
    pub vertex_buffer: Option<wgpu::Buffer>,
    pub index_buffer: Option<wgpu::Buffer>,
    pub quad_vertex_buffer: Option<wgpu::Buffer>,
    pub quad_index_buffer: Option<wgpu::Buffer>,
    pub num_indices: u32,
    pub num_quad_indices: u32,
    pub instance_count: u32,
    pub instances_dirty: bool,
}

impl RenderSystem {
    pub fn new() -> Self {
        Self {
            uniform_buffer: None,
            instance_buffer: None,
            scene_pipeline: None,
            bind_group: None,
            vertex_buffer: None,
            index_buffer: None,
            quad_vertex_buffer: None,
            quad_index_buffer: None,
            num_indices: 0,
            num_quad_indices: 0,
            instance_count: 0,
            instances_dirty: false,
        }
    }
}

pub struct BeamSystem {
    pub beam_uniform_buffer: Option<wgpu::Buffer>,
    pub scatter_uniform_buffer: Option<wgpu::Buffer>,
    pub ray_march_pipeline: Option<wgpu::RenderPipeline>,
    pub scatter_pipeline: Option<wgpu::RenderPipeline>,
    pub beam_bind_group: Option<wgpu::BindGroup>,
    pub scatter_bind_group: Option<wgpu::BindGroup>,
    pub beam_bind_group_layout: Option<wgpu::BindGroupLayout>,
    pub scatter_bind_group_layout: Option<wgpu::BindGroupLayout>,
}

impl BeamSystem {
    pub fn new() -> Self {
        Self {
            beam_uniform_buffer: None,
            scatter_uniform_buffer: None,
            ray_march_pipeline: None,
            scatter_pipeline: None,
            beam_bind_group: None,
            scatter_bind_group: None,
            beam_bind_group_layout: None,
            scatter_bind_group_layout: None,
        }
    }
}

pub struct InputSystem {
    pub current_keys: InputFlags,
    pub prev_keys: InputFlags,
}

impl InputSystem {
    pub fn new() -> Self {
        Self {
            current_keys: InputFlags::empty(),
            prev_keys: InputFlags::empty(),
        }
    }
}

pub struct TimingSystem {
    #[cfg(not(target_arch = "wasm32"))]
    pub start: Instant,
    #[cfg(target_arch = "wasm32")]
    pub start_time_ms: f64,
    pub last_frame_time: f32,
    pub delta_time: f32,
    pub frame_count: u32,
}

impl TimingSystem {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_arch = "wasm32"))]
            start: Instant::now(),
            #[cfg(target_arch = "wasm32")]
            start_time_ms: Self::now_ms(),
            last_frame_time: 0.0,
            delta_time: 0.0,
            frame_count: 0,
        }
    }

    pub fn elapsed_seconds(&self) -> f32 {
        #[cfg(not(target_arch = "wasm32"))]
        {
            self.start.elapsed().as_secs_f32()
        }

        #[cfg(target_arch = "wasm32")]
        {
            let now_ms = Self::now_ms();
            ((now_ms - self.start_time_ms) / 1000.0) as f32
        }
    }

    #[cfg(target_arch = "wasm32")]
    fn now_ms() -> f64 {
        web_sys::window()
            .and_then(|w| w.performance())
            .map(|p| p.now())
            .unwrap_or_else(|| js_sys::Date::now())
    }
}

pub struct StatsAccumulator {
    pub frame_times: [f32; 60],
    pub frame_index: usize,
    pub update_timer: f32,
    #[cfg(target_arch = "wasm32")]
    pub stats_buffer: String,
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self {
            frame_times: [0.0; 60],
            frame_index: 0,
            update_timer: 0.0,
            #[cfg(target_arch = "wasm32")]
            stats_buffer: String::new(),
        }
    }
}

// ============================
// === CORE IMPLEMENTATIONS ===
// ============================

impl EngineCore {
    pub fn new() -> Self {
        Self {
            tunnel: TunnelSystem::new(),
            camera: CameraSystem::new(),
            light: LightRig::new(),
            tuning: TuningConfig::default(),
            render: RenderSystem::new(),
            beam: BeamSystem::new(),
            input: InputSystem::new(),
            timing: TimingSystem::new(),
            state_flags: StateFlags::RUNNING | StateFlags::LIGHT_SWAY,
            stats_accumulator: StatsAccumulator::default(),
        }
    }

    #[inline(always)]
    pub fn update_and_render(&mut self, window_state: &mut WindowState) -> Result<(), wgpu::SurfaceError> {
        let current_time = self.timing.elapsed_seconds();
        let raw_delta = current_time - self.timing.last_frame_time;

        // Early exit for frame limiting (native applicable only)
        if raw_delta < FRAME_TIME {
            return Ok(());
        }

        self.timing.delta_time = raw_delta;
        self.timing.last_frame_time = current_time;
        self.timing.frame_count += 1;

        self.process_input();

        if !self.state_flags.contains(StateFlags::PAUSED) {
            self.tunnel.advance(self.tuning.recycler_speed, self.timing.delta_time);
            self.camera.sway(current_time);
            if self.state_flags.contains(StateFlags::LIGHT_SWAY) {
                self.light.sway(current_time);
            }
        }

        if self.state_flags.contains(StateFlags::REGEN_FIELDS) {
            self.state_flags.remove(StateFlags::REGEN_FIELDS);
            self.tunnel.regenerate();
            self.render.instances_dirty = true;
        }

        self.update_gpu_resources(window_state);

        if MINIMAL_LOGGING || LOGGING_ENABLED {
            self.stats_accumulator.frame_times[self.stats_accumulator.frame_index] = self.timing.delta_time;
            self.stats_accumulator.frame_index = (self.stats_accumulator.frame_index + 1) % 60;
            self.stats_accumulator.update_timer += self.timing.delta_time;

            if self.stats_accumulator.update_timer >= STATS_UPDATE_INTERVAL {
                self.update_stats();
            }
        }

        self.render_frame(window_state)
    }

    // Frame based input processing
    #[inline(always)]
    fn process_input(&mut self) {
        let pressed = self.input.current_keys & !self.input.prev_keys;

        if pressed.contains(InputFlags::P) {
            self.state_flags.toggle(StateFlags::PAUSED);
        }
        if pressed.contains(InputFlags::V) {
            self.state_flags.toggle(StateFlags::RADIAL_SCATTER);
            log_line(&format!(
                "Volumetric kernel: {}",
                if self.state_flags.contains(StateFlags::RADIAL_SCATTER) { "RadialScatter" } else { "RayMarch" }
            ));
        }
        if pressed.contains(InputFlags::B) {
            self.state_flags.toggle(StateFlags::SCATTER_BLUR);
        }
        if pressed.contains(InputFlags::L) {
            self.state_flags.toggle(StateFlags::LIGHT_SWAY);
        }
        if pressed.contains(InputFlags::G) {
            self.state_flags.insert(StateFlags::REGEN_FIELDS);
        }
        if pressed.contains(InputFlags::R) {
            self.tuning = TuningConfig::default();
            log_line("Tuning reset to defaults");
        }
        if pressed.contains(InputFlags::ESC) {
            self.state_flags.insert(StateFlags::SHOULD_EXIT);
        }

        // Held adjustments, all range-clamped at this boundary.
        let t = &mut self.tuning;
        let keys = self.input.current_keys;
        if keys.contains(InputFlags::ARROW_UP) {
            t.set_beam_density(t.beam_density + DENSITY_STEP);
        }
        if keys.contains(InputFlags::ARROW_DOWN) {
            t.set_beam_density(t.beam_density - DENSITY_STEP);
        }
        if keys.contains(InputFlags::ARROW_RIGHT) {
            t.set_half_angle_deg(t.half_angle_deg + HALF_ANGLE_STEP);
        }
        if keys.contains(InputFlags::ARROW_LEFT) {
            t.set_half_angle_deg(t.half_angle_deg - HALF_ANGLE_STEP);
        }
        if keys.contains(InputFlags::DIGIT1) {
            t.set_recycler_speed(t.recycler_speed - SPEED_STEP);
        }
        if keys.contains(InputFlags::DIGIT2) {
            t.set_recycler_speed(t.recycler_speed + SPEED_STEP);
        }
        if keys.contains(InputFlags::Q) {
            t.set_attenuation_k(t.attenuation_k - ATTENUATION_STEP);
        }
        if keys.contains(InputFlags::E) {
            t.set_attenuation_k(t.attenuation_k + ATTENUATION_STEP);
        }
        if keys.contains(InputFlags::W) {
            t.set_scatter_weight(t.scatter_weight + WEIGHT_STEP);
        }
        if keys.contains(InputFlags::S) {
            t.set_scatter_weight(t.scatter_weight - WEIGHT_STEP);
        }
        if keys.contains(InputFlags::A) {
            t.set_scatter_decay(t.scatter_decay - DECAY_STEP);
        }
        if keys.contains(InputFlags::D) {
            t.set_scatter_decay(t.scatter_decay + DECAY_STEP);
        }

        self.input.prev_keys = self.input.current_keys;
    }

    fn scene_uniforms(&self) -> SceneUniforms {
        SceneUniforms {
            view_proj: self.camera.view_proj_matrix.to_cols_array_2d(),
            camera_position: self.camera.position.to_array(),
            time: self.timing.elapsed_seconds(),
            cone_apex: self.light.apex.to_array(),
            cos_half_angle: self.tuning.cos_half_angle(),
            cone_axis: self.light.axis().to_array(),
            attenuation_k: self.tuning.attenuation_k,
            beam_color: self.light.color.to_array(),
            _pad0: 0.0,
            segment_offsets: [self.tunnel.segment_a.offset, self.tunnel.segment_b.offset],
            segment_split: self.tunnel.field_a.len() as u32,
            frame_index: self.timing.frame_count,
        }
    }

    fn beam_uniforms(&self) -> BeamUniforms {
        BeamUniforms {
            inv_proj: self.camera.inv_proj_matrix.to_cols_array_2d(),
            inv_view: self.camera.inv_view_matrix.to_cols_array_2d(),
            cone_apex: self.light.apex.to_array(),
            cos_half_angle: self.tuning.cos_half_angle(),
            cone_axis: self.light.axis().to_array(),
            attenuation_k: self.tuning.attenuation_k,
            beam_color: self.light.color.to_array(),
            density: self.tuning.beam_density,
            camera_position: self.camera.position.to_array(),
            sample_count: self.tuning.sample_count,
            frame_index: self.timing.frame_count,
            time: self.timing.elapsed_seconds(),
            _pad0: [0.0; 2],
        }
    }

    fn scatter_uniforms(&self) -> ScatterUniforms {
        // A light behind the camera suppresses the kernel for the frame;
        // everything else still renders.
        let (light_uv, weight) = match self.light.screen_position(self.camera.view_proj_matrix) {
            Some(uv) => (uv, self.tuning.scatter_weight),
            None => (Vec2::new(0.5, 0.5), 0.0),
        };
        ScatterUniforms {
            light_screen_pos: light_uv.to_array(),
            sample_count: self.tuning.sample_count,
            decay: self.tuning.scatter_decay,
            weight,
            exposure: self.tuning.scatter_exposure,
            density: self.tuning.scatter_density,
            blur_enabled: self.state_flags.contains(StateFlags::SCATTER_BLUR) as u32,
        }
    }

    fn update_gpu_resources(&mut self, window_state: &WindowState) {
        if let Some(buffer) = &self.render.uniform_buffer {
            window_state.queue.write_buffer(buffer, 0, bytemuck::cast_slice(&[self.scene_uniforms()]));
        }
        if let Some(buffer) = &self.beam.beam_uniform_buffer {
            window_state.queue.write_buffer(buffer, 0, bytemuck::cast_slice(&[self.beam_uniforms()]));
        }
        if let Some(buffer) = &self.beam.scatter_uniform_buffer {
            window_state.queue.write_buffer(buffer, 0, bytemuck::cast_slice(&[self.scatter_uniforms()]));
        }
        if self.render.instances_dirty {
            if let Some(buffer) = &self.render.instance_buffer {
                let raw = self.tunnel.raw_instances();
                window_state.queue.write_buffer(buffer, 0, bytemuck::cast_slice(&raw));
                self.render.instance_count = raw.len() as u32;
            }
            self.render.instances_dirty = false;
        }
    }

    #[inline(always)]
    fn render_frame(&self, window_state: &mut WindowState) -> Result<(), wgpu::SurfaceError> {
        let output = window_state.surface.get_current_texture()?;
        let surface_view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = window_state.device.create_command_encoder(&Default::default());

        // Scene pass: instanced particle walls into the offscreen HDR target.
        {
            let mut scene_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Scene Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &window_state.scene_color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &window_state.scene_depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            if let (Some(pipeline), Some(bind_group), Some(vb), Some(ib), Some(inst)) = (
                &self.render.scene_pipeline,
                &self.render.bind_group,
                &self.render.vertex_buffer,
                &self.render.index_buffer,
                &self.render.instance_buffer,
            ) {
                scene_pass.set_pipeline(pipeline);
                scene_pass.set_bind_group(0, bind_group, &[]);
                scene_pass.set_vertex_buffer(0, vb.slice(..));
                scene_pass.set_vertex_buffer(1, inst.slice(..));
                scene_pass.set_index_buffer(ib.slice(..), wgpu::IndexFormat::Uint16);
                scene_pass.draw_indexed(0..self.render.num_indices, 0, 0..self.render.instance_count);
            }
        }

        // Beam pass: full-screen kernel over the scene buffer, to the surface.
        {
            let mut beam_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Beam Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &surface_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let use_scatter = self.state_flags.contains(StateFlags::RADIAL_SCATTER);
            let (pipeline, bind_group) = if use_scatter {
                (&self.beam.scatter_pipeline, &self.beam.scatter_bind_group)
            } else {
                (&self.beam.ray_march_pipeline, &self.beam.beam_bind_group)
            };

            if let (Some(pipeline), Some(bind_group), Some(vb), Some(ib)) = (
                pipeline,
                bind_group,
                &self.render.quad_vertex_buffer,
                &self.render.quad_index_buffer,
            ) {
                beam_pass.set_pipeline(pipeline);
                beam_pass.set_bind_group(0, bind_group, &[]);
                beam_pass.set_vertex_buffer(0, vb.slice(..));
                beam_pass.set_index_buffer(ib.slice(..), wgpu::IndexFormat::Uint16);
                beam_pass.draw_indexed(0..self.render.num_quad_indices, 0, 0..1);
            }
        }

        window_state.queue.submit([encoder.finish()]);
        window_state.window.pre_present_notify();
        output.present();

        Ok(())
    }

    fn update_stats(&mut self) {
        if self.stats_accumulator.update_timer < STATS_UPDATE_INTERVAL {
            return;
        }
        self.stats_accumulator.update_timer = 0.0;

        let sum = self.stats_accumulator.frame_times.iter().sum::<f32>();
        let avg_frame_time = sum / 60.0;
        let fps = 1.0 / avg_frame_time.max(1.0e-6);
        let kernel = if self.state_flags.contains(StateFlags::RADIAL_SCATTER) { "Scatter" } else { "March" };

        #[cfg(not(target_arch = "wasm32"))]
        if MINIMAL_LOGGING {
            println!(
                "FPS: {:.1}, Frame: {:.2}ms, Kernel: {}, Samples: {}, HalfAngle: {:.0}°",
                fps,
                avg_frame_time * 1000.0,
                kernel,
                self.tuning.sample_count,
                self.tuning.half_angle_deg
            );
        }

        #[cfg(target_arch = "wasm32")]
        if MINIMAL_LOGGING {
            use std::fmt::Write;
            self.stats_accumulator.stats_buffer.clear();
            let _ = write!(
                &mut self.stats_accumulator.stats_buffer,
                "<div>FPS: {:.1}</div><div>Frame: {:.2}ms</div><div>Kernel: {}</div><div>Samples: {}</div>",
                fps,
                avg_frame_time * 1000.0,
                kernel,
                self.tuning.sample_count
            );

            if let Some(window) = web_sys::window() {
                if let Some(document) = window.document() {
                    if let Some(stats_element) = document.get_element_by_id("stats") {
                        stats_element.set_inner_html(&self.stats_accumulator.stats_buffer);
                    }
                }
            }
        }
    }

    pub fn handle_key_input(&mut self, physical_key: &PhysicalKey, pressed: bool) {
        let flag = match physical_key {
            PhysicalKey::Code(WinitKeyCode::KeyP) => Some(InputFlags::P),
            PhysicalKey::Code(WinitKeyCode::KeyV) => Some(InputFlags::V),
            PhysicalKey::Code(WinitKeyCode::KeyB) => Some(InputFlags::B),
            PhysicalKey::Code(WinitKeyCode::KeyR) => Some(InputFlags::R),
            PhysicalKey::Code(WinitKeyCode::KeyG) => Some(InputFlags::G),
            PhysicalKey::Code(WinitKeyCode::KeyL) => Some(InputFlags::L),
            PhysicalKey::Code(WinitKeyCode::KeyQ) => Some(InputFlags::Q),
            PhysicalKey::Code(WinitKeyCode::KeyE) => Some(InputFlags::E),
            PhysicalKey::Code(WinitKeyCode::KeyW) => Some(InputFlags::W),
            PhysicalKey::Code(WinitKeyCode::KeyS) => Some(InputFlags::S),
            PhysicalKey::Code(WinitKeyCode::KeyA) => Some(InputFlags::A),
            PhysicalKey::Code(WinitKeyCode::KeyD) => Some(InputFlags::D),
            PhysicalKey::Code(WinitKeyCode::Escape) => Some(InputFlags::ESC),
            PhysicalKey::Code(WinitKeyCode::Digit1) => Some(InputFlags::DIGIT1),
            PhysicalKey::Code(WinitKeyCode::Digit2) => Some(InputFlags::DIGIT2),
            PhysicalKey::Code(WinitKeyCode::ArrowUp) => Some(InputFlags::ARROW_UP),
            PhysicalKey::Code(WinitKeyCode::ArrowDown) => Some(InputFlags::ARROW_DOWN),
            PhysicalKey::Code(WinitKeyCode::ArrowLeft) => Some(InputFlags::ARROW_LEFT),
            PhysicalKey::Code(WinitKeyCode::ArrowRight) => Some(InputFlags::ARROW_RIGHT),
            _ => None,
        };

        if let Some(flag) = flag {
            if pressed {
                self.input.current_keys.insert(flag);
            } else {
                self.input.current_keys.remove(flag);
            }
        }
    }

    pub fn should_exit(&self) -> bool {
        self.state_flags.contains(StateFlags::SHOULD_EXIT)
    }
}

fn log_line(msg: &str) {
    #[cfg(not(target_arch = "wasm32"))]
    println!("{}", msg);
    #[cfg(target_arch = "wasm32")]
    web_sys::console::log_1(&msg.into());
}

// ======================================
// === WINDOW STATE ===
// ======================================

pub struct WindowState {
    pub surface: wgpu::Surface<'static>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub config: wgpu::SurfaceConfiguration,
    pub window: Arc<Window>,
    pub scene_color_texture: wgpu::Texture,
    pub scene_color_view: wgpu::TextureView,
    pub scene_depth_texture: wgpu::Texture,
    pub scene_depth_view: wgpu::TextureView,
}

impl WindowState {
    pub async fn new(window: Arc<Window>) -> WindowState {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "wasm32")] {
                let size = winit::dpi::PhysicalSize::new(DIMX, DIMY);
                let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                    backends: wgpu::Backends::BROWSER_WEBGPU,
                    ..Default::default()
                });
                let limits = wgpu::Limits::downlevel_webgl2_defaults();
            } else {
                let size = window.inner_size();
                let instance = wgpu::Instance::default();
                let limits = wgpu::Limits::default();
            }
        }

        let surface = instance.create_surface(window.clone()).expect("Failed to create surface");

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: Some(&surface),
            })
            .await
            .expect("Failed to find an adapter");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: None,
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: Default::default(),
                    trace: Default::default(),
                }
            )
            .await
            .expect("Failed to create device");

        let caps = surface.get_capabilities(&adapter);
        let surface_format = Self::select_surface_format(&caps.formats);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width,
            height: size.height,
            present_mode: if cfg!(target_arch = "wasm32") {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::Immediate
            },
            alpha_mode: wgpu::CompositeAlphaMode::Auto,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        surface.configure(&device, &config);

        let (scene_color_texture, scene_color_view) = Self::create_scene_color(&device, &config);
        let (scene_depth_texture, scene_depth_view) = Self::create_scene_depth(&device, &config);

        Self {
            window,
            surface,
            device,
            queue,
            config,
            scene_color_texture,
            scene_color_view,
            scene_depth_texture,
            scene_depth_view,
        }
    }

    /// Both kernels gamma-encode manually at the end of the beam pass, so
    /// the swapchain must not re-encode. Some backends list an sRGB format
    /// first; prefer the first non-sRGB one, falling back to whatever the
    /// surface offers.
    fn select_surface_format(formats: &[wgpu::TextureFormat]) -> wgpu::TextureFormat {
        formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .unwrap_or(formats[0])
    }

    fn create_scene_color(device: &wgpu::Device, config: &wgpu::SurfaceConfiguration) -> (wgpu::Texture, wgpu::TextureView) {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Scene Color Texture"),
            size: wgpu::Extent3d {
                width: config.width,
                height: config.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    fn create_scene_depth(device: &wgpu::Device, config: &wgpu::SurfaceConfiguration) -> (wgpu::Texture, wgpu::TextureView) {
        // Depth32Float so the beam pass can read linearizable depth directly.
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Scene Depth Texture"),
            size: wgpu::Extent3d {
                width: config.width,
                height: config.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    fn create_noise_texture(&self, label: &str, noise: &NoiseField) -> wgpu::TextureView {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: noise.size,
                height: noise.size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &noise.to_bytes(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(noise.size),
                rows_per_image: Some(noise.size),
            },
            wgpu::Extent3d {
                width: noise.size,
                height: noise.size,
                depth_or_array_layers: 1,
            },
        );
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    pub fn initialize_render_data(&self, core: &mut EngineCore) {
        // Scene uniforms + instance data
        let uniform_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Scene Uniform Buffer"),
            size: std::mem::size_of::<SceneUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let raw_instances = core.tunnel.raw_instances();
        let instance_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Instance Buffer"),
            contents: bytemuck::cast_slice(&raw_instances),
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        });

        let beam_uniform_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Beam Uniform Buffer"),
            size: std::mem::size_of::<BeamUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let scatter_uniform_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Scatter Uniform Buffer"),
            size: std::mem::size_of::<ScatterUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Geometry: unit cube for instancing, full-screen quad for the kernels.
        let (cube_vertices, cube_indices) = Self::create_cube_mesh();
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cube Vertex Buffer"),
            contents: bytemuck::cast_slice(&cube_vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Cube Index Buffer"),
            contents: bytemuck::cast_slice(&cube_indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        let (quad_vertices, quad_indices) = Self::create_fullscreen_quad();
        let quad_vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Vertex Buffer"),
            contents: bytemuck::cast_slice(&quad_vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let quad_index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Quad Index Buffer"),
            contents: bytemuck::cast_slice(&quad_indices),
            usage: wgpu::BufferUsages::INDEX,
        });

        // Scene pipeline
        let scene_bind_group_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
            label: Some("scene_bind_group_layout"),
        });

        let scene_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            layout: &scene_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
            label: Some("scene_bind_group"),
        });

        let scene_shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Scene Shader"),
            source: wgpu::ShaderSource::Wgsl(generate_scene_shader().into()),
        });

        let scene_pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Scene Pipeline Layout"),
            bind_group_layouts: &[&scene_bind_group_layout],
            push_constant_ranges: &[],
        });

        let scene_pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Scene Pipeline"),
            layout: Some(&scene_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &scene_shader,
                entry_point: Some("vs_main"),
                buffers: &[Vertex::desc(), ParticleInstanceRaw::desc()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &scene_shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba16Float,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: wgpu::TextureFormat::Depth32Float,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        core.render.uniform_buffer = Some(uniform_buffer);
        core.render.instance_buffer = Some(instance_buffer);
        core.render.scene_pipeline = Some(scene_pipeline);
        core.render.bind_group = Some(scene_bind_group);
        core.render.vertex_buffer = Some(vertex_buffer);
        core.render.index_buffer = Some(index_buffer);
        core.render.quad_vertex_buffer = Some(quad_vertex_buffer);
        core.render.quad_index_buffer = Some(quad_index_buffer);
        core.render.num_indices = cube_indices.len() as u32;
        core.render.num_quad_indices = quad_indices.len() as u32;
        core.render.instance_count = raw_instances.len() as u32;

        core.beam.beam_uniform_buffer = Some(beam_uniform_buffer);
        core.beam.scatter_uniform_buffer = Some(scatter_uniform_buffer);

        self.initialize_beam_pipelines(core);
    }

    fn initialize_beam_pipelines(&self, core: &mut EngineCore) {
        let texture_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };

        let beam_bind_group_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                texture_entry(3),
                texture_entry(4),
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 6,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
            label: Some("beam_bind_group_layout"),
        });

        let scatter_bind_group_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
            label: Some("scatter_bind_group_layout"),
        });

        let beam_shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Beam Shader"),
            source: wgpu::ShaderSource::Wgsl(generate_beam_shader().into()),
        });
        let scatter_shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Scatter Shader"),
            source: wgpu::ShaderSource::Wgsl(generate_scatter_shader().into()),
        });

        let beam_pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Beam Pipeline Layout"),
            bind_group_layouts: &[&beam_bind_group_layout],
            push_constant_ranges: &[],
        });
        let scatter_pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Scatter Pipeline Layout"),
            bind_group_layouts: &[&scatter_bind_group_layout],
            push_constant_ranges: &[],
        });

        let fullscreen_pipeline = |label: &str, layout: &wgpu::PipelineLayout, shader: &wgpu::ShaderModule| {
            self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: shader,
                    entry_point: Some("vs_main"),
                    buffers: &[Vertex::desc()],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: self.config.format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState {
                    count: 1,
                    mask: !0,
                    alpha_to_coverage_enabled: false,
                },
                multiview: None,
                cache: None,
            })
        };

        let ray_march_pipeline = fullscreen_pipeline("Ray March Pipeline", &beam_pipeline_layout, &beam_shader);
        let scatter_pipeline = fullscreen_pipeline("Scatter Pipeline", &scatter_pipeline_layout, &scatter_shader);

        core.beam.beam_bind_group_layout = Some(beam_bind_group_layout);
        core.beam.scatter_bind_group_layout = Some(scatter_bind_group_layout);
        core.beam.ray_march_pipeline = Some(ray_march_pipeline);
        core.beam.scatter_pipeline = Some(scatter_pipeline);

        self.rebuild_beam_bind_groups(core);
    }

    /// (Re)build the kernel bind groups against the current offscreen
    /// targets. Called at init and again after every resize.
    pub fn rebuild_beam_bind_groups(&self, core: &mut EngineCore) {
        let blue_view = self.create_noise_texture("Blue Noise Texture", &core.tunnel.blue_noise);
        let turb_view = self.create_noise_texture("Turbulence Noise Texture", &core.tunnel.turbulence);

        let clamp_sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Clamp Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let wrap_sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Wrap Sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        if let (Some(layout), Some(beam_uniforms)) =
            (&core.beam.beam_bind_group_layout, &core.beam.beam_uniform_buffer)
        {
            let beam_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: beam_uniforms.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&self.scene_color_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&self.scene_depth_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: wgpu::BindingResource::TextureView(&blue_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: wgpu::BindingResource::TextureView(&turb_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: wgpu::BindingResource::Sampler(&clamp_sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: wgpu::BindingResource::Sampler(&wrap_sampler),
                    },
                ],
                label: Some("beam_bind_group"),
            });
            core.beam.beam_bind_group = Some(beam_bind_group);
        }

        if let (Some(layout), Some(scatter_uniforms)) =
            (&core.beam.scatter_bind_group_layout, &core.beam.scatter_uniform_buffer)
        {
            let scatter_bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: scatter_uniforms.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&self.scene_color_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::Sampler(&clamp_sampler),
                    },
                ],
                label: Some("scatter_bind_group"),
            });
            core.beam.scatter_bind_group = Some(scatter_bind_group);
        }
    }

    pub fn resize(&mut self, width: u32, height: u32, core: &mut EngineCore) {
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.surface.configure(&self.device, &self.config);

        let (color_tex, color_view) = Self::create_scene_color(&self.device, &self.config);
        self.scene_color_texture = color_tex;
        self.scene_color_view = color_view;
        let (depth_tex, depth_view) = Self::create_scene_depth(&self.device, &self.config);
        self.scene_depth_texture = depth_tex;
        self.scene_depth_view = depth_view;

        core.camera.update_aspect_ratio(self.config.width as f32 / self.config.height as f32);
        self.rebuild_beam_bind_groups(core);
    }

    fn create_cube_mesh() -> (Vec<Vertex>, Vec<u16>) {
        // Small unit cube, scaled per instance.
        let s = 0.06f32;
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            // (normal, tangent u, tangent v)
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices: Vec<u16> = Vec::with_capacity(36);
        for (face_idx, (n, u, v)) in faces.iter().enumerate() {
            let n3 = Vec3::from_array(*n);
            let u3 = Vec3::from_array(*u);
            let v3 = Vec3::from_array(*v);
            let corners = [
                n3 * s - u3 * s - v3 * s,
                n3 * s + u3 * s - v3 * s,
                n3 * s + u3 * s + v3 * s,
                n3 * s - u3 * s + v3 * s,
            ];
            let uvs = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
            for (corner, uv) in corners.iter().zip(uvs.iter()) {
                vertices.push(Vertex {
                    position: corner.to_array(),
                    normal: *n,
                    uv: *uv,
                });
            }
            let base = (face_idx * 4) as u16;
            indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }
        (vertices, indices)
    }

    fn create_fullscreen_quad() -> (Vec<Vertex>, Vec<u16>) {
        let vertices = vec![
            Vertex { position: [-1.0, -1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [0.0, 1.0] },
            Vertex { position: [ 1.0, -1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [1.0, 1.0] },
            Vertex { position: [ 1.0,  1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [1.0, 0.0] },
            Vertex { position: [-1.0,  1.0, 0.0], normal: [0.0, 0.0, 1.0], uv: [0.0, 0.0] },
        ];
        let indices = vec![0, 1, 2, 2, 3, 0];
        (vertices, indices)
    }
}

// ======================================
// === UNIFIED APPLICATION ===
// ======================================

pub struct TunnelApp {
    pub core: EngineCore,
    pub window_state: Option<WindowState>,
    pub window: Option<Arc<Window>>,
    #[cfg(target_arch = "wasm32")]
    pub state_initializing: bool,
}

impl Default for TunnelApp {
    fn default() -> Self {
        Self {
            core: EngineCore::new(),
            window_state: None,
            window: None,
            #[cfg(target_arch = "wasm32")]
            state_initializing: false,
        }
    }
}

impl TunnelApp {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_arch = "wasm32")]
    fn initialize_stats_display(&mut self) {
        if let Some(window) = web_sys::window() {
            if let Some(document) = window.document() {
                if let Some(app_container) = document.get_element_by_id("app") {
                    let app_style = app_container.dyn_ref::<web_sys::HtmlElement>().unwrap().style();
                    app_style.set_property("position", "relative").unwrap();

                    let stats_div = document.create_element("div").unwrap();
                    stats_div.set_id("stats");

                    let style = stats_div.dyn_ref::<web_sys::HtmlElement>().unwrap().style();
                    style.set_property("position", "absolute").unwrap();
                    style.set_property("top", "10px").unwrap();
                    style.set_property("left", "10px").unwrap();
                    style.set_property("z-index", "1000").unwrap();
                    style.set_property("background", "rgba(0,0,0,0.8)").unwrap();
                    style.set_property("color", "white").unwrap();
                    style.set_property("padding", "10px").unwrap();
                    style.set_property("font-family", "monospace").unwrap();
                    style.set_property("font-size", "12px").unwrap();
                    style.set_property("border-radius", "4px").unwrap();

                    app_container.append_child(&stats_div).unwrap();
                }
            }
        }
    }

    pub fn update(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(window_state) = &mut self.window_state {
            if let Err(e) = self.core.update_and_render(window_state) {
                match e {
                    wgpu::SurfaceError::Lost => {
                        window_state.surface.configure(&window_state.device, &window_state.config);
                    }
                    wgpu::SurfaceError::OutOfMemory => {
                        self.core.state_flags.insert(StateFlags::SHOULD_EXIT);
                    }
                    _ => {
                        #[cfg(target_arch = "wasm32")]
                        web_sys::console::error_1(&format!("Render error: {:?}", e).into());
                        #[cfg(not(target_arch = "wasm32"))]
                        eprintln!("Render error: {:?}", e);
                    }
                }
            }
        }

        if self.core.should_exit() {
            event_loop.exit();
        }

        self.request_next_frame();
    }

    fn request_next_frame(&self) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

impl ApplicationHandler for TunnelApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let window = Arc::new(
            event_loop
                .create_window(
                    Window::default_attributes()
                        .with_title("TunnelW v0.1.0")
                        .with_inner_size(winit::dpi::PhysicalSize::new(DIMX, DIMY))
                )
                .unwrap(),
        );

        window.set_min_inner_size(Some(winit::dpi::PhysicalSize::new(DIMX, DIMY)));

        #[cfg(target_arch = "wasm32")]
        {
            use winit::platform::web::WindowExtWebSys;

            let _ = window.request_inner_size(winit::dpi::PhysicalSize::new(DIMX, DIMY));

            if let Some(canvas) = window.canvas() {
                let web_window = web_sys::window().unwrap();
                let document = web_window.document().unwrap();

                let container = document.get_element_by_id("app")
                    .unwrap_or_else(|| document.body().unwrap().into());

                canvas.set_width(DIMX.into());
                canvas.set_height(DIMY.into());

                let style = canvas.style();
                style.set_property("width", &format!("{}px", DIMX)).unwrap();
                style.set_property("height", &format!("{}px", DIMY)).unwrap();

                container.append_child(&web_sys::Element::from(canvas))
                    .expect("Couldn't append canvas to document");
            }

            self.window = Some(window.clone());
            self.state_initializing = true;

            let window_clone = window.clone();
            let app_ptr = self as *mut TunnelApp;
            wasm_bindgen_futures::spawn_local(async move {
                let state = WindowState::new(window_clone).await;
                unsafe {
                    let app = &mut *app_ptr;
                    state.initialize_render_data(&mut app.core);
                    app.window_state = Some(state);
                    app.state_initializing = false;
                    app.core.state_flags.insert(StateFlags::RUNNING);
                }
            });

            if MINIMAL_LOGGING || LOGGING_ENABLED {
                self.initialize_stats_display();
            }

            window.request_redraw();
            return;
        }

        #[cfg(not(target_arch = "wasm32"))]
        {
            let state = pollster::block_on(WindowState::new(window.clone()));
            state.initialize_render_data(&mut self.core);
            self.window_state = Some(state);
            self.window = Some(window.clone());
            self.core.state_flags.insert(StateFlags::RUNNING);
            window.request_redraw();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, id: WindowId, event: WindowEvent) {
        let window = match &self.window {
            Some(window) => window,
            None => return,
        };

        if window.id() != id {
            return;
        }

        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                self.core.handle_key_input(&event.physical_key, event.state == winit::event::ElementState::Pressed);
            }
            WindowEvent::Resized(physical_size) => {
                if let Some(window_state) = &mut self.window_state {
                    window_state.resize(physical_size.width, physical_size.height, &mut self.core);
                }
            }
            WindowEvent::CloseRequested => {
                self.core.state_flags.insert(StateFlags::SHOULD_EXIT);
            }
            WindowEvent::RedrawRequested => {
                self.update(event_loop);
            }
            _ => {}
        }
    }
}

// ======================================
// === MAIN ENTRY POINT ===
// ======================================

#[cfg_attr(target_arch = "wasm32", wasm_bindgen(start))]
pub fn run() {
    if MINIMAL_LOGGING || LOGGING_ENABLED {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "wasm32")] {
                std::panic::set_hook(Box::new(console_error_panic_hook::hook));
                console_log::init_with_level(log::Level::Info).expect("Couldn't initialize logger");
                web_sys::console::log_1(&"Started TunnelW v0.1.0".into());
            } else {
                env_logger::init();
                log::info!("Started TunnelW v0.1.0");
            }
        }
    }

    let event_loop = EventLoop::new().unwrap();
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = TunnelApp::new();
    event_loop.run_app(&mut app).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- GPU struct layout ---

    #[test]
    fn uniform_struct_layouts() {
        assert_eq!(std::mem::size_of::<SceneUniforms>(), 144);
        assert_eq!(std::mem::size_of::<BeamUniforms>(), 208);
        assert_eq!(std::mem::size_of::<ScatterUniforms>(), 32);
        assert_eq!(std::mem::size_of::<SceneUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<BeamUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<ScatterUniforms>() % 16, 0);
    }

    #[test]
    fn vertex_struct_layouts() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::size_of::<ParticleInstanceRaw>(), 80);
    }

    #[test]
    fn surface_format_selection_avoids_srgb_reencode() {
        // Vulkan commonly lists the sRGB variant first; picking it would
        // double-apply the shaders' manual gamma.
        let vulkan_like = [
            wgpu::TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Bgra8Unorm,
            wgpu::TextureFormat::Rgba8UnormSrgb,
        ];
        assert_eq!(
            WindowState::select_surface_format(&vulkan_like),
            wgpu::TextureFormat::Bgra8Unorm
        );

        let srgb_only = [wgpu::TextureFormat::Bgra8UnormSrgb];
        assert_eq!(
            WindowState::select_surface_format(&srgb_only),
            wgpu::TextureFormat::Bgra8UnormSrgb
        );
    }

    // --- Depth-to-world reconstruction ---

    #[test]
    fn depth_reconstruction_round_trips() {
        let cam = CameraSystem::new();
        for &p in &[
            Vec3::new(0.0, 0.0, -5.0),
            Vec3::new(1.5, -2.0, -20.0),
            Vec3::new(-3.0, 2.5, -60.0),
        ] {
            let clip = cam.view_proj_matrix * Vec4::new(p.x, p.y, p.z, 1.0);
            assert!(clip.w > 0.0, "test point must be in front of the camera");
            let ndc = Vec2::new(clip.x / clip.w, clip.y / clip.w);
            let depth = clip.z / clip.w;
            let recon = world_from_depth(ndc, depth, cam.inv_proj_matrix, cam.inv_view_matrix);
            assert!((recon - p).length() < 1.0e-2, "reconstructed {:?} from {:?}", recon, p);
        }
    }

    // --- Ray-cone intersection ---

    #[test]
    fn cone_entry_toward_apex_from_axis_point() {
        let apex = Vec3::new(0.0, 5.0, 0.0);
        let axis = Vec3::new(0.0, -1.0, 0.0);
        let c = 30.0f32.to_radians().cos();
        // Origin 3 units down the axis, ray pointing back at the apex.
        let t = ray_cone_entry(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 1.0, 0.0), apex, axis, c);
        let expected = 3.0 * (1.0 - c) / (1.0 + c);
        assert!(t.is_finite());
        assert!(t > 0.0 && t < BEAM_FAR);
        assert!((t - expected).abs() < 1.0e-4);
    }

    #[test]
    fn cone_entry_deeper_along_axis_is_sentinel() {
        let apex = Vec3::new(0.0, 5.0, 0.0);
        let axis = Vec3::new(0.0, -1.0, 0.0);
        let c = 30.0f32.to_radians().cos();
        let t = ray_cone_entry(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, -1.0, 0.0), apex, axis, c);
        assert_eq!(t, BEAM_FAR);
    }

    #[test]
    fn cone_entry_origin_outside_wedge_is_sentinel() {
        let apex = Vec3::new(0.0, 5.0, 0.0);
        let axis = Vec3::new(0.0, -1.0, 0.0);
        let c = 30.0f32.to_radians().cos();
        // Level with the apex, perpendicular to the axis: b < 0.
        let t = ray_cone_entry(Vec3::new(10.0, 5.0, 0.0), Vec3::new(0.0, -1.0, 0.0), apex, axis, c);
        assert_eq!(t, BEAM_FAR);
    }

    #[test]
    fn cone_entry_sideways_exit_distance() {
        let apex = Vec3::new(0.0, 5.0, 0.0);
        let axis = Vec3::new(0.0, -1.0, 0.0);
        let c = 30.0f32.to_radians().cos();
        let dir = Vec3::new(0.8, -0.6, 0.0);
        let t = ray_cone_entry(Vec3::new(0.0, 2.0, 0.0), dir, apex, axis, c);
        let b = 3.0 * (1.0 - c);
        let a = 0.6 - c;
        assert!((t - (-b / a)).abs() < 1.0e-4);
    }

    #[test]
    fn cone_entry_near_zero_half_angle_is_finite() {
        let apex = Vec3::new(0.0, 5.0, 0.0);
        let axis = Vec3::new(0.0, -1.0, 0.0);
        let mut tuning = TuningConfig::default();
        tuning.set_half_angle_deg(0.0);
        let c = tuning.cos_half_angle();
        assert!(c < 1.0);
        let t = ray_cone_entry(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 1.0, 0.0), apex, axis, c);
        assert!(t.is_finite() && !t.is_nan());
        assert!(t >= 0.0);
    }

    // --- Volumetric march reference kernel ---

    fn test_beam_params() -> BeamParams {
        BeamParams {
            apex: Vec3::new(0.0, 5.0, 0.0),
            axis: Vec3::new(0.0, -1.0, 0.0),
            cos_half_angle: 30.0f32.to_radians().cos(),
            attenuation_k: 0.0,
            density: 1.0,
            sample_count: 64,
        }
    }

    #[test]
    fn march_zero_length_ray_is_empty() {
        let params = test_beam_params();
        let noise = NoiseField::neutral();
        let cam = Vec3::new(0.0, 2.0, 0.0);
        let d = march_beam(cam, cam, &params, &noise, 0.0, 0.0);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn march_zero_samples_is_empty() {
        let mut params = test_beam_params();
        params.sample_count = 0;
        let noise = NoiseField::neutral();
        let d = march_beam(Vec3::new(0.0, 2.0, 0.0), Vec3::new(4.0, -1.0, 0.0), &params, &noise, 0.0, 0.0);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn march_accumulates_inside_beam() {
        let params = test_beam_params();
        let noise = NoiseField::neutral();
        // Camera inside the wedge, ray exits through the side well before
        // the surface, so the first stretch of samples is lit.
        let d = march_beam(Vec3::new(0.0, 2.0, 0.0), Vec3::new(4.0, -1.0, 0.0), &params, &noise, 0.0, 0.0);
        assert!(d.is_finite());
        assert!(d > 0.0);
    }

    #[test]
    fn march_scales_linearly_with_density() {
        let mut params = test_beam_params();
        let noise = NoiseField::neutral();
        let cam = Vec3::new(0.0, 2.0, 0.0);
        let surface = Vec3::new(4.0, -1.0, 0.0);
        let d1 = march_beam(cam, surface, &params, &noise, 0.0, 0.0);
        params.density = 2.0;
        let d2 = march_beam(cam, surface, &params, &noise, 0.0, 0.0);
        assert!((d2 - 2.0 * d1).abs() < 1.0e-4);
    }

    #[test]
    fn march_respects_depth_occlusion() {
        let params = test_beam_params();
        let noise = NoiseField::neutral();
        let cam = Vec3::new(0.0, 2.0, 0.0);
        // Same direction as the lit case, surface pulled in front of the
        // wedge crossing: the depth bound suppresses everything.
        let surface = cam + Vec3::new(0.8, -0.6, 0.0) * 0.05;
        let d = march_beam(cam, surface, &params, &noise, 0.0, 0.0);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn march_outside_wedge_is_zero() {
        let params = test_beam_params();
        let noise = NoiseField::neutral();
        let d = march_beam(Vec3::new(20.0, 5.0, 0.0), Vec3::new(20.0, -1.0, 0.0), &params, &noise, 0.0, 0.0);
        assert_eq!(d, 0.0);
    }

    // --- Radial scatter reference kernel ---

    fn test_scatter_params() -> ScatterParams {
        ScatterParams {
            sample_count: 64,
            decay: 0.95,
            weight: 0.02,
            exposure: 1.0,
            density: 0.9,
        }
    }

    #[test]
    fn scatter_zero_samples_is_black() {
        let mut params = test_scatter_params();
        params.sample_count = 0;
        let out = radial_scatter(|_| Vec3::ONE, Vec2::new(0.3, 0.3), Vec2::new(0.5, 0.5), &params);
        assert_eq!(out, Vec3::ZERO);
    }

    #[test]
    fn scatter_matches_geometric_series_on_flat_input() {
        let params = test_scatter_params();
        let out = radial_scatter(|_| Vec3::ONE, Vec2::new(0.2, 0.8), Vec2::new(0.5, 0.5), &params);
        let mut expected = 0.0f32;
        let mut decay = 1.0f32;
        for _ in 0..params.sample_count {
            expected += params.weight * decay;
            decay *= params.decay;
        }
        expected *= params.exposure;
        assert!((out.x - expected).abs() < 1.0e-4);
        assert!((out.y - expected).abs() < 1.0e-4);
        assert!((out.z - expected).abs() < 1.0e-4);
    }

    #[test]
    fn scatter_monotonic_in_weight_and_decay() {
        let mut params = test_scatter_params();
        let uv = Vec2::new(0.1, 0.9);
        let light = Vec2::new(0.5, 0.5);
        let base = radial_scatter(|_| Vec3::ONE, uv, light, &params).x;

        params.weight = 0.04;
        let heavier = radial_scatter(|_| Vec3::ONE, uv, light, &params).x;
        assert!(heavier > base);

        params.weight = 0.02;
        params.decay = 0.99;
        let slower = radial_scatter(|_| Vec3::ONE, uv, light, &params).x;
        assert!(slower > base);
    }

    // --- Particle field generator ---

    fn small_field_params() -> FieldParams {
        FieldParams {
            capacity: 400,
            ..FieldParams::default()
        }
    }

    #[test]
    fn field_is_deterministic_per_seed() {
        let params = small_field_params();
        let noise = NoiseField::neutral();
        let a = generate_field(&params, &noise, &mut StdRng::seed_from_u64(7));
        let b = generate_field(&params, &noise, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        let c = generate_field(&params, &noise, &mut StdRng::seed_from_u64(8));
        assert_ne!(a, c);
    }

    #[test]
    fn field_instances_sit_on_the_walls() {
        let params = small_field_params();
        let noise = NoiseField::neutral();
        let field = generate_field(&params, &noise, &mut StdRng::seed_from_u64(11));
        assert_eq!(field.len(), params.capacity);

        let half_t = params.wall_thickness * 0.5;
        let hw = params.box_width * 0.5;
        let hh = params.box_height * 0.5;
        for inst in &field {
            let p = inst.position;
            assert!(face_of(p, &params).is_some(), "off-wall instance at {:?}", p);
            assert!(p.z.abs() <= params.box_depth * 0.5 + 1.0e-4);
            assert!(p.x.abs() <= hw + half_t + 1.0e-4);
            assert!(p.y.abs() <= hh + half_t + 1.0e-4);
        }
    }

    #[test]
    fn field_zero_randomness_uses_base_values() {
        let params = FieldParams {
            capacity: 50,
            size_randomness: 0.0,
            rotation_randomness: 0.0,
            color_randomness: 0.0,
            base_rotation: Vec3::ZERO,
            ..FieldParams::default()
        };
        let noise = NoiseField::neutral();
        let field = generate_field(&params, &noise, &mut StdRng::seed_from_u64(3));
        for inst in &field {
            assert!((inst.scale - 1.0).abs() < 1.0e-6);
            assert!((inst.rotation - Vec3::ZERO).length() < 1.0e-6);
            assert!((inst.color - params.base_color).length() < 1.0e-6);
        }
    }

    #[test]
    fn field_culling_preserves_capacity() {
        let params = FieldParams {
            capacity: 300,
            noise_threshold: 0.6,
            ..FieldParams::default()
        };
        let noise = NoiseField::value_noise(64, 42, 2);
        let field = generate_field(&params, &noise, &mut StdRng::seed_from_u64(5));
        assert_eq!(field.len(), params.capacity);

        // Unsatisfiable threshold exhausts the attempt budget but still
        // returns a full batch.
        let impossible = FieldParams { noise_threshold: 2.0, ..params };
        let field = generate_field(&impossible, &noise, &mut StdRng::seed_from_u64(5));
        assert_eq!(field.len(), impossible.capacity);
    }

    // --- Tunnel recycler ---

    #[test]
    fn wrap_offset_stays_in_range() {
        let d = 50.0;
        for &x in &[-175.0f32, -75.0, -50.0, -0.1, 0.0, 3.0, 24.9, 25.0, 123.0, 1.0e4] {
            let w = wrap_offset(x, d);
            assert!((-1.5 * d..0.5 * d).contains(&w), "wrap_offset({}) = {}", x, w);
        }
        assert_eq!(wrap_offset(3.0, d), 3.0);
        assert_eq!(wrap_offset(-1.5 * d, d), -1.5 * d);
        // Reaching the forward edge teleports a full period back.
        assert_eq!(wrap_offset(0.5 * d, d), -1.5 * d);
    }

    #[test]
    fn segments_keep_one_depth_separation() {
        let d = BOX_DEPTH;
        let mut a = TunnelSegment { offset: 0.0 };
        let mut b = TunnelSegment { offset: -d };
        for i in 0..5000 {
            // Uneven steps, including one larger than the full wrap period.
            let dt = if i % 97 == 0 { 12.5 } else { 0.016 };
            advance_segments(&mut a, &mut b, 9.0, dt, d);
            assert!((-1.5 * d..0.5 * d).contains(&a.offset));
            assert!((-1.5 * d..0.5 * d).contains(&b.offset));
            let sep = (a.offset - b.offset).rem_euclid(2.0 * d);
            assert!((sep - d).abs() < 5.0e-2, "separation drifted to {}", sep);
        }
    }

    #[test]
    fn corridor_keeps_a_full_depth_ahead_of_camera() {
        let d = BOX_DEPTH;
        let mut a = TunnelSegment { offset: 0.0 };
        let mut b = TunnelSegment { offset: -d };
        for _ in 0..20_000 {
            advance_segments(&mut a, &mut b, 9.0, 0.016, d);
            // Each segment spans +-d/2 around its offset and the camera looks
            // down -z from the origin, so the corridor reaches forward to the
            // rear segment's leading edge.
            let forward_edge = a.offset.min(b.offset) - d * 0.5;
            assert!(
                forward_edge <= -d + 5.0e-2,
                "forward coverage shrank to {} units",
                -forward_edge
            );
        }
    }

    // --- Camera and light rig ---

    #[test]
    fn light_behind_camera_has_no_screen_position() {
        let mut cam = CameraSystem::new();
        cam.position = Vec3::ZERO;
        cam.target = Vec3::new(0.0, 0.0, -1.0);
        cam.rebuild_matrices();

        let mut light = LightRig::new();
        light.apex = Vec3::new(0.0, 0.0, 50.0);
        assert!(light.screen_position(cam.view_proj_matrix).is_none());

        light.apex = Vec3::new(0.0, 0.0, -10.0);
        let uv = light.screen_position(cam.view_proj_matrix).unwrap();
        assert!((uv.x - 0.5).abs() < 1.0e-4);
        assert!((uv.y - 0.5).abs() < 1.0e-4);
    }

    // --- Tuning boundary ---

    #[test]
    fn tuning_clamps_at_the_boundary() {
        let mut t = TuningConfig::default();
        t.set_half_angle_deg(-10.0);
        assert_eq!(t.half_angle_deg, 0.5);
        t.set_half_angle_deg(180.0);
        assert_eq!(t.half_angle_deg, 89.0);
        t.set_sample_count(0);
        assert_eq!(t.sample_count, 1);
        t.set_sample_count(1_000_000);
        assert_eq!(t.sample_count, BEAM_MAX_SAMPLES);
        t.set_scatter_decay(1.5);
        assert!(t.scatter_decay < 1.0);
        t.set_attenuation_k(-1.0);
        assert_eq!(t.attenuation_k, 0.0);
    }

    #[test]
    fn pause_toggle_uses_edge_detection() {
        let mut core = EngineCore::new();
        assert!(!core.state_flags.contains(StateFlags::PAUSED));

        core.handle_key_input(&PhysicalKey::Code(WinitKeyCode::KeyP), true);
        core.process_input();
        assert!(core.state_flags.contains(StateFlags::PAUSED));

        // Held key must not re-toggle.
        core.process_input();
        assert!(core.state_flags.contains(StateFlags::PAUSED));

        core.handle_key_input(&PhysicalKey::Code(WinitKeyCode::KeyP), false);
        core.process_input();
        core.handle_key_input(&PhysicalKey::Code(WinitKeyCode::KeyP), true);
        core.process_input();
        assert!(!core.state_flags.contains(StateFlags::PAUSED));
    }

    // --- Noise assets ---

    #[test]
    fn neutral_noise_samples_to_one() {
        let n = NoiseField::neutral();
        for &(u, v) in &[(0.0, 0.0), (0.3, 0.9), (-4.2, 17.5)] {
            assert_eq!(n.sample(u, v), 1.0);
        }
    }

    #[test]
    fn value_noise_is_deterministic_and_normalized() {
        let a = NoiseField::value_noise(64, 123, 3);
        let b = NoiseField::value_noise(64, 123, 3);
        assert_eq!(a.data, b.data);
        for &v in &a.data {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn noise_sampling_wraps_around() {
        let n = NoiseField::value_noise(32, 9, 2);
        for &(u, v) in &[(0.1f32, 0.7f32), (0.5, 0.25), (0.9, 0.05)] {
            assert!((n.sample(u, v) - n.sample(u + 1.0, v)).abs() < 1.0e-3);
            assert!((n.sample(u, v) - n.sample(u, v - 1.0)).abs() < 1.0e-3);
        }
    }

    #[test]
    fn interleaved_gradient_stays_in_unit_range() {
        let n = NoiseField::interleaved_gradient(BLUE_NOISE_SIZE);
        assert_eq!(n.data.len(), (BLUE_NOISE_SIZE * BLUE_NOISE_SIZE) as usize);
        for &v in &n.data {
            assert!((0.0..1.0).contains(&v));
        }
    }

    // --- Color jitter helpers ---

    #[test]
    fn hsl_round_trips() {
        for &c in &[
            Vec3::new(0.55, 0.52, 0.48),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.2, 0.7, 0.3),
            Vec3::new(0.5, 0.5, 0.5),
        ] {
            let (h, s, l) = rgb_to_hsl(c);
            let back = hsl_to_rgb(h, s, l);
            assert!((back - c).length() < 1.0e-3, "{:?} -> {:?}", c, back);
        }
    }
}
