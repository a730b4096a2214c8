//! Typed atomic storage for stage buffers.
//!
//! Cells hold raw 64-bit patterns (`i64` values or `f64` bits) in
//! `AtomicU64`, so plain, read-modify-write and CAS accesses all share one
//! representation and the parallel/atomic semantics of the lowered program
//! are exercised for real. Plain accesses are relaxed: cross-thread
//! ordering comes from the fork-join and semaphore synchronization of the
//! tree, never from data races on cells.

use std::sync::atomic::{AtomicU64, Ordering};

use fresnel_ir::{BinaryOp, ConstValue, ScalarType};

use crate::error::{Error, Result};

/// Allocation cap: pipelines under test never need more; a miscomputed
/// region should fail loudly instead of thrashing.
const CELL_CAP: u64 = 1 << 28;

#[derive(Debug, Clone, Copy)]
pub struct BufDim {
    pub min: i64,
    pub extent: i64,
    pub fold: Option<i64>,
}

#[derive(Debug)]
pub struct Buffer {
    pub ty: ScalarType,
    pub dims: Vec<BufDim>,
    cells: Vec<AtomicU64>,
}

fn encode(ty: ScalarType, v: ConstValue) -> Result<u64> {
    Ok(match (ty, v) {
        (ScalarType::Float32 | ScalarType::Float64, ConstValue::Float(f)) => f.to_bits(),
        (ScalarType::Float32 | ScalarType::Float64, ConstValue::Int(i)) => (i as f64).to_bits(),
        (ScalarType::Int32 | ScalarType::Int64, ConstValue::Int(i)) => i as u64,
        (ScalarType::Bool, ConstValue::Bool(b)) => b as u64,
        (ty, v) => {
            return Err(Error::TypeError { detail: format!("cannot store {v:?} into {ty} buffer") })
        }
    })
}

fn decode(ty: ScalarType, bits: u64) -> ConstValue {
    match ty {
        ScalarType::Float32 | ScalarType::Float64 => ConstValue::Float(f64::from_bits(bits)),
        ScalarType::Int32 | ScalarType::Int64 => ConstValue::Int(bits as i64),
        ScalarType::Bool => ConstValue::Bool(bits != 0),
    }
}

impl Buffer {
    pub fn new(stage: &str, ty: ScalarType, dims: Vec<BufDim>) -> Result<Buffer> {
        let mut cells: u64 = 1;
        for d in &dims {
            let extent = d.extent.max(0) as u64;
            cells = cells.saturating_mul(extent);
        }
        if cells > CELL_CAP {
            return Err(Error::AllocationTooLarge { stage: stage.to_string(), cells, cap: CELL_CAP });
        }
        let mut storage = Vec::with_capacity(cells as usize);
        storage.resize_with(cells as usize, || AtomicU64::new(0));
        Ok(Buffer { ty, dims, cells: storage })
    }

    /// Flat offset of a logical index tuple. Folded dimensions address the
    /// wrapped coordinate directly (the lowering already rewrote indices
    /// modulo the fold); unfolded dimensions are rebased on the region min.
    fn offset(&self, stage: &str, indices: &[i64]) -> Result<usize> {
        if indices.len() != self.dims.len() {
            return Err(Error::TypeError {
                detail: format!("stage '{stage}': {} indices for rank {}", indices.len(), self.dims.len()),
            });
        }
        let mut off: i64 = 0;
        // Dimension 0 is innermost (stride 1).
        for (d, idx) in self.dims.iter().zip(indices).rev() {
            let rel = match d.fold {
                Some(_) => *idx,
                None => idx - d.min,
            };
            if rel < 0 || rel >= d.extent {
                return Err(Error::OutOfBounds {
                    stage: stage.to_string(),
                    dim: self.dims.iter().position(|x| std::ptr::eq(x, d)).unwrap_or(0),
                    index: *idx,
                    min: if d.fold.is_some() { 0 } else { d.min },
                    min_plus_extent: if d.fold.is_some() { d.extent } else { d.min + d.extent },
                });
            }
            off = off * d.extent + rel;
        }
        Ok(off as usize)
    }

    pub fn load(&self, stage: &str, indices: &[i64]) -> Result<ConstValue> {
        let off = self.offset(stage, indices)?;
        Ok(decode(self.ty, self.cells[off].load(Ordering::Relaxed)))
    }

    pub fn store(&self, stage: &str, indices: &[i64], v: ConstValue) -> Result<()> {
        let off = self.offset(stage, indices)?;
        self.cells[off].store(encode(self.ty, v)?, Ordering::Relaxed);
        Ok(())
    }

    /// One atomic read-modify-write with a commutative/associative operator.
    pub fn rmw(&self, stage: &str, indices: &[i64], op: BinaryOp, operand: ConstValue) -> Result<()> {
        let off = self.offset(stage, indices)?;
        let ty = self.ty;
        self.cells[off]
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old_bits| {
                let old = decode(ty, old_bits);
                crate::value::apply_binary(op, old, operand).ok().and_then(|new| encode(ty, new).ok())
            })
            .map_err(|_| Error::TypeError { detail: format!("atomic rmw on stage '{stage}' failed") })?;
        Ok(())
    }

    /// Compare-and-swap retry loop: `recompute` sees the freshly read value
    /// and produces the replacement; re-attempted until it wins.
    pub fn cas_update(
        &self,
        stage: &str,
        indices: &[i64],
        mut recompute: impl FnMut(ConstValue) -> Result<ConstValue>,
    ) -> Result<()> {
        let off = self.offset(stage, indices)?;
        loop {
            let old_bits = self.cells[off].load(Ordering::SeqCst);
            let old = decode(self.ty, old_bits);
            let new = recompute(old)?;
            let new_bits = encode(self.ty, new)?;
            if self.cells[off]
                .compare_exchange(old_bits, new_bits, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}
