use async_trait::async_trait;
use image::imageops::FilterType;
use image::GrayImage;

use super::glb::{self, Mesh};
use super::{Artifact, ConversionInput, Converter, ConverterError};

pub const DEFAULT_GRID: u32 = 64;
const MIN_GRID: u32 = 2;
const MAX_GRID: u32 = 512;
const HEIGHT_SCALE: f32 = 0.25;

/// Turns an image into a height field: brighter pixels become higher
/// vertices on a unit-wide grid, written out as binary glTF.
#[derive(Debug, Clone)]
pub struct HeightmapConverter {
    grid: u32,
}

impl Default for HeightmapConverter {
    fn default() -> Self {
        Self::new(DEFAULT_GRID)
    }
}

impl HeightmapConverter {
    pub fn new(grid: u32) -> Self {
        Self {
            grid: grid.clamp(MIN_GRID, MAX_GRID),
        }
    }

    pub fn build_mesh(&self, bytes: &[u8]) -> Result<Mesh, ConverterError> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| ConverterError::new(format!("unsupported image: {e}")))?;

        let (w, h) = (img.width(), img.height());
        if w < MIN_GRID || h < MIN_GRID {
            return Err(ConverterError::new(format!(
                "image too small: {w}x{h}, need at least {MIN_GRID}x{MIN_GRID}"
            )));
        }

        // keep aspect ratio; the longer side gets `grid` samples
        let (cols, rows) = if w >= h {
            let rows = ((self.grid as u64 * h as u64) / w as u64).max(MIN_GRID as u64) as u32;
            (self.grid.min(w), rows.min(h))
        } else {
            let cols = ((self.grid as u64 * w as u64) / h as u64).max(MIN_GRID as u64) as u32;
            (cols.min(w), self.grid.min(h))
        };

        let luma = img.resize_exact(cols, rows, FilterType::Triangle).to_luma8();
        Ok(self.height_field(&luma))
    }

    fn height_field(&self, luma: &GrayImage) -> Mesh {
        let (cols, rows) = luma.dimensions();
        let longest = cols.max(rows) as f32 - 1.0;
        let half_x = (cols as f32 - 1.0) / longest / 2.0;
        let half_z = (rows as f32 - 1.0) / longest / 2.0;

        let height = |x: u32, z: u32| luma.get_pixel(x, z).0[0] as f32 / 255.0 * HEIGHT_SCALE;

        let mut positions = Vec::with_capacity((cols * rows) as usize);
        let mut normals = Vec::with_capacity((cols * rows) as usize);
        for z in 0..rows {
            for x in 0..cols {
                let px = x as f32 / longest - half_x;
                let pz = z as f32 / longest - half_z;
                positions.push([px, height(x, z), pz]);

                // central differences, clamped at the border
                let dx = height((x + 1).min(cols - 1), z) - height(x.saturating_sub(1), z);
                let dz = height(x, (z + 1).min(rows - 1)) - height(x, z.saturating_sub(1));
                let step = 2.0 / longest;
                normals.push(normalize([-dx / step, 1.0, -dz / step]));
            }
        }

        let mut indices = Vec::with_capacity(((cols - 1) * (rows - 1) * 6) as usize);
        for z in 0..rows - 1 {
            for x in 0..cols - 1 {
                let i = z * cols + x;
                let below = i + cols;
                indices.extend_from_slice(&[i, below, i + 1, i + 1, below, below + 1]);
            }
        }

        Mesh {
            positions,
            normals,
            indices,
        }
    }
}

fn normalize(v: [f32; 3]) -> [f32; 3] {
    let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if len == 0.0 {
        return [0.0, 1.0, 0.0];
    }
    [v[0] / len, v[1] / len, v[2] / len]
}

#[async_trait]
impl Converter for HeightmapConverter {
    async fn convert(&self, input: ConversionInput) -> Result<Artifact, ConverterError> {
        let this = self.clone();
        let job_id = input.job_id;
        let mesh = tokio::task::spawn_blocking(move || this.build_mesh(&input.bytes))
            .await
            .map_err(|e| {
                tracing::error!(%job_id, error = %e, "heightmap worker crashed");
                ConverterError::new("heightmap worker crashed")
            })??;

        tracing::debug!(
            %job_id,
            vertices = mesh.positions.len(),
            triangles = mesh.indices.len() / 3,
            "built height field"
        );

        Ok(Artifact::glb(glb::encode(&mesh)))
    }
}
