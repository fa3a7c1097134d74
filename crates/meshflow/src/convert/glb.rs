//! Minimal binary glTF 2.0 writer: one mesh, one primitive, one buffer.

use serde_json::json;

const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF"
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const FLOAT: u32 = 5126;
const UNSIGNED_INT: u32 = 5125;
const TRIANGLES: u32 = 4;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<u32>,
}

impl Mesh {
    fn bounds(&self) -> ([f32; 3], [f32; 3]) {
        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];
        for p in &self.positions {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        (min, max)
    }
}

fn push_vec3s(buf: &mut Vec<u8>, items: &[[f32; 3]]) {
    for v in items {
        for c in v {
            buf.extend_from_slice(&c.to_le_bytes());
        }
    }
}

fn pad_to_4(buf: &mut Vec<u8>, fill: u8) {
    while buf.len() % 4 != 0 {
        buf.push(fill);
    }
}

/// Serialises `mesh` as a self-contained `.glb` file.
pub fn encode(mesh: &Mesh) -> Vec<u8> {
    debug_assert_eq!(mesh.positions.len(), mesh.normals.len());

    let mut bin = Vec::with_capacity(
        mesh.positions.len() * 24 + mesh.indices.len() * 4,
    );
    push_vec3s(&mut bin, &mesh.positions);
    let positions_len = bin.len();
    push_vec3s(&mut bin, &mesh.normals);
    let normals_len = bin.len() - positions_len;
    for i in &mesh.indices {
        bin.extend_from_slice(&i.to_le_bytes());
    }
    let indices_len = bin.len() - positions_len - normals_len;
    pad_to_4(&mut bin, 0);

    let (min, max) = mesh.bounds();
    let doc = json!({
        "asset": { "version": "2.0", "generator": "meshflow" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
        "meshes": [{
            "primitives": [{
                "attributes": { "POSITION": 0, "NORMAL": 1 },
                "indices": 2,
                "mode": TRIANGLES
            }]
        }],
        "buffers": [{ "byteLength": bin.len() }],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": positions_len, "target": ARRAY_BUFFER },
            { "buffer": 0, "byteOffset": positions_len, "byteLength": normals_len, "target": ARRAY_BUFFER },
            { "buffer": 0, "byteOffset": positions_len + normals_len, "byteLength": indices_len, "target": ELEMENT_ARRAY_BUFFER }
        ],
        "accessors": [
            {
                "bufferView": 0, "componentType": FLOAT, "count": mesh.positions.len(),
                "type": "VEC3", "min": min, "max": max
            },
            { "bufferView": 1, "componentType": FLOAT, "count": mesh.normals.len(), "type": "VEC3" },
            { "bufferView": 2, "componentType": UNSIGNED_INT, "count": mesh.indices.len(), "type": "SCALAR" }
        ]
    });

    let mut json_chunk = doc.to_string().into_bytes();
    pad_to_4(&mut json_chunk, b' ');

    let total = 12 + 8 + json_chunk.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());

    out.extend_from_slice(&(json_chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_chunk);

    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    fn triangle() -> Mesh {
        Mesh {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            normals: vec![[0.0, 0.0, 1.0]; 3],
            indices: vec![0, 1, 2],
        }
    }

    #[test]
    fn header_and_chunks_are_consistent() {
        let glb = encode(&triangle());

        assert_eq!(&glb[0..4], b"glTF");
        assert_eq!(u32_at(&glb, 4), 2);
        assert_eq!(u32_at(&glb, 8) as usize, glb.len());
        assert_eq!(glb.len() % 4, 0);

        let json_len = u32_at(&glb, 12) as usize;
        assert_eq!(u32_at(&glb, 16), CHUNK_JSON);
        let bin_header = 20 + json_len;
        assert_eq!(u32_at(&glb, bin_header + 4), CHUNK_BIN);
        let bin_len = u32_at(&glb, bin_header) as usize;
        // 3 positions + 3 normals (36 bytes each) + 3 indices
        assert_eq!(bin_len, 36 + 36 + 12);
        assert_eq!(bin_header + 8 + bin_len, glb.len());
    }

    #[test]
    fn json_chunk_describes_the_buffer() {
        let glb = encode(&triangle());
        let json_len = u32_at(&glb, 12) as usize;
        let doc: serde_json::Value = serde_json::from_slice(&glb[20..20 + json_len]).unwrap();

        assert_eq!(doc["asset"]["version"], "2.0");
        assert_eq!(doc["accessors"][0]["count"], 3);
        assert_eq!(doc["accessors"][0]["max"], json!([1.0, 1.0, 0.0]));
        assert_eq!(doc["accessors"][2]["componentType"], UNSIGNED_INT);
        assert_eq!(doc["bufferViews"][2]["byteOffset"], 72);
        assert_eq!(doc["buffers"][0]["byteLength"], 84);
    }
}
