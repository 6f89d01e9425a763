//! Bit-exact, bespoke binary serialization for [`super::Model`].
//!
//! The format is deliberately simple: a fixed-size header of shape
//! constants, then every parameter block in the declared order from the
//! data model, each written as a little-endian `f32` stream. Loading
//! refuses a file whose shape constants disagree with the `ModelShape` it
//! is asked to populate, and never assumes an optional block (the output
//! projection) is present unless the header's `tie_output_embedding` flag
//! says so.

use std::io::{Read, Write};

use crate::error::{TrainingError, TrainingResult};
use crate::model::{LayerWeights, Model, ModelShape};
use crate::tensor::Mat;

const MAGIC: u32 = 0x4c41_5454; // "LATT"
const FORMAT_VERSION: u32 = 1;

fn io_err(source: std::io::Error) -> TrainingError {
    TrainingError::IoError {
        path: std::path::PathBuf::new(),
        source,
    }
}

fn write_u32(w: &mut impl Write, v: u32) -> TrainingResult<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_u64(w: &mut impl Write, v: u64) -> TrainingResult<()> {
    w.write_all(&v.to_le_bytes()).map_err(io_err)
}

fn write_f32_slice(w: &mut impl Write, data: &[f32]) -> TrainingResult<()> {
    for &v in data {
        w.write_all(&v.to_le_bytes()).map_err(io_err)?;
    }
    Ok(())
}

fn write_mat(w: &mut impl Write, m: &Mat) -> TrainingResult<()> {
    write_u64(w, m.rows as u64)?;
    write_u64(w, m.cols as u64)?;
    write_f32_slice(w, &m.data)
}

fn read_u32(r: &mut impl Read) -> TrainingResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> TrainingResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32_vec(r: &mut impl Read, len: usize) -> TrainingResult<Vec<f32>> {
    let mut out = Vec::new();
    out.try_reserve(len)
        .map_err(|e| TrainingError::AllocationFailure(e.to_string()))?;
    let mut buf = [0u8; 4];
    for _ in 0..len {
        r.read_exact(&mut buf).map_err(io_err)?;
        out.push(f32::from_le_bytes(buf));
    }
    Ok(out)
}

fn read_mat(r: &mut impl Read) -> TrainingResult<Mat> {
    let rows = read_u64(r)? as usize;
    let cols = read_u64(r)? as usize;
    let data = read_f32_vec(r, rows * cols)?;
    Ok(Mat { rows, cols, data })
}

/// Writes `model` to `writer` in the bit-exact format described above.
pub fn save(model: &Model, writer: &mut impl Write) -> TrainingResult<()> {
    write_u32(writer, MAGIC)?;
    write_u32(writer, FORMAT_VERSION)?;
    write_u64(writer, model.shape.vocab_size as u64)?;
    write_u64(writer, model.shape.d_model as u64)?;
    write_u64(writer, model.shape.n_heads as u64)?;
    write_u64(writer, model.shape.d_ff as u64)?;
    write_u64(writer, model.shape.n_layers as u64)?;
    write_u64(writer, model.shape.max_seq_len as u64)?;
    write_u32(writer, model.shape.tie_output_embedding as u32)?;

    write_mat(writer, &model.embedding)?;
    for layer in &model.layers {
        write_mat(writer, &layer.wq)?;
        write_mat(writer, &layer.wk)?;
        write_mat(writer, &layer.wv)?;
        write_mat(writer, &layer.wo)?;
        write_mat(writer, &layer.ffn_w1)?;
        write_f32_slice(writer, &layer.ffn_b1)?;
        write_mat(writer, &layer.ffn_w2)?;
        write_f32_slice(writer, &layer.ffn_b2)?;
        write_f32_slice(writer, &layer.ln1_gamma)?;
        write_f32_slice(writer, &layer.ln1_beta)?;
        write_f32_slice(writer, &layer.ln2_gamma)?;
        write_f32_slice(writer, &layer.ln2_beta)?;
    }
    write_f32_slice(writer, &model.ln_final_gamma)?;
    write_f32_slice(writer, &model.ln_final_beta)?;
    if let Some(proj) = &model.output_proj {
        write_mat(writer, proj)?;
    }
    Ok(())
}

/// Reads a model back, verifying its shape constants equal `expected`
/// before trusting any of the parameter bytes that follow.
pub fn load(reader: &mut impl Read, expected: ModelShape) -> TrainingResult<Model> {
    let magic = read_u32(reader)?;
    if magic != MAGIC {
        return Err(TrainingError::FormatError(format!(
            "bad magic: expected {MAGIC:#x}, got {magic:#x}"
        )));
    }
    let version = read_u32(reader)?;
    if version != FORMAT_VERSION {
        return Err(TrainingError::FormatError(format!(
            "unsupported format version {version}"
        )));
    }

    let shape = ModelShape {
        vocab_size: read_u64(reader)? as usize,
        d_model: read_u64(reader)? as usize,
        n_heads: read_u64(reader)? as usize,
        d_ff: read_u64(reader)? as usize,
        n_layers: read_u64(reader)? as usize,
        max_seq_len: read_u64(reader)? as usize,
        tie_output_embedding: read_u32(reader)? != 0,
    };
    if shape != expected {
        return Err(TrainingError::FormatError(format!(
            "model shape {shape:?} does not match expected {expected:?}"
        )));
    }

    let embedding = read_mat(reader)?;
    let mut layers = Vec::with_capacity(shape.n_layers);
    for _ in 0..shape.n_layers {
        layers.push(LayerWeights {
            wq: read_mat(reader)?,
            wk: read_mat(reader)?,
            wv: read_mat(reader)?,
            wo: read_mat(reader)?,
            ffn_w1: read_mat(reader)?,
            ffn_b1: read_f32_vec(reader, shape.d_ff)?,
            ffn_w2: read_mat(reader)?,
            ffn_b2: read_f32_vec(reader, shape.d_model)?,
            ln1_gamma: read_f32_vec(reader, shape.d_model)?,
            ln1_beta: read_f32_vec(reader, shape.d_model)?,
            ln2_gamma: read_f32_vec(reader, shape.d_model)?,
            ln2_beta: read_f32_vec(reader, shape.d_model)?,
        });
    }
    let ln_final_gamma = read_f32_vec(reader, shape.d_model)?;
    let ln_final_beta = read_f32_vec(reader, shape.d_model)?;
    let output_proj = if shape.tie_output_embedding {
        None
    } else {
        Some(read_mat(reader)?)
    };

    Ok(Model {
        shape,
        embedding,
        layers,
        ln_final_gamma,
        ln_final_beta,
        output_proj,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;

    fn small_config() -> TrainingConfig {
        let mut cfg = TrainingConfig::default();
        cfg.vocab_size = 20;
        cfg.d_model = 8;
        cfg.n_heads = 2;
        cfg.d_ff = 16;
        cfg.n_layers = 1;
        cfg.max_seq_len = 8;
        cfg
    }

    #[test]
    fn round_trips_bit_exact() {
        let cfg = small_config();
        let model = Model::new(&cfg).unwrap();
        let mut buf = Vec::new();
        save(&model, &mut buf).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let loaded = load(&mut cursor, model.shape).unwrap();

        assert_eq!(model.embedding.data, loaded.embedding.data);
        assert_eq!(model.layers[0].wq.data, loaded.layers[0].wq.data);
        assert_eq!(model.ln_final_gamma, loaded.ln_final_gamma);
    }

    #[test]
    fn rejects_mismatched_shape() {
        let cfg = small_config();
        let model = Model::new(&cfg).unwrap();
        let mut buf = Vec::new();
        save(&model, &mut buf).unwrap();

        let mut wrong_shape = model.shape;
        wrong_shape.d_model += 8;
        let mut cursor = std::io::Cursor::new(buf);
        assert!(load(&mut cursor, wrong_shape).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; 64];
        let mut cursor = std::io::Cursor::new(bytes);
        let cfg = small_config();
        let model = Model::new(&cfg).unwrap();
        assert!(load(&mut cursor, model.shape).is_err());
    }
}
