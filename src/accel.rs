//! Alternate execution backend for the triangular kernels.
//!
//! An [`Accelerator`] receives flat tile contents as bytes tagged with a
//! [`ScalarKind`], runs `trsm`/`trmm` in its own memory and hands the result
//! back. [`HostAccelerator`] emulates a device in host memory with a
//! capacity limit so the staging protocol and its failure modes can be
//! exercised without hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use num_complex::{Complex32, Complex64};

use crate::error::{Error, Result};
use crate::kernels::{blas, Diag, Side, Trans, Uplo};
use crate::tile::{MatMut, MatRef};
use crate::traits::{Field, ScalarKind};

/// Where the triangular kernels run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputingModel {
    #[default]
    Cpu,
    Accelerator,
    /// Worker threads with an index below `accelerated_threads` use the
    /// accelerator, the others the CPU kernels.
    Mixed { accelerated_threads: usize },
}

impl ComputingModel {
    pub(crate) fn selects_accelerator(&self) -> bool {
        match self {
            ComputingModel::Cpu => false,
            ComputingModel::Accelerator => true,
            ComputingModel::Mixed {
                accelerated_threads,
            } => rayon::current_thread_index().map_or(false, |i| i < *accelerated_threads),
        }
    }
}

/// A triangular operation with a real scaling factor.
#[derive(Debug, Clone, Copy)]
pub struct TriOp {
    pub side: Side,
    pub uplo: Uplo,
    pub trans: Trans,
    pub diag: Diag,
    pub alpha: f64,
}

/// Handle to a tile staged on the device.
#[derive(Debug)]
pub struct DeviceTile {
    id: u64,
    kind: ScalarKind,
    rows: usize,
    cols: usize,
}

impl DeviceTile {
    pub fn new(id: u64, kind: ScalarKind, rows: usize, cols: usize) -> Self {
        Self {
            id,
            kind,
            rows,
            cols,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }
}

pub trait Accelerator: Send + Sync {
    /// Copy column-major tile contents into device memory.
    fn stage_in(&self, kind: ScalarKind, rows: usize, cols: usize, data: &[u8]) -> Result<DeviceTile>;

    /// Copy a device tile back and release it.
    fn stage_out(&self, tile: DeviceTile, out: &mut [u8]) -> Result<()>;

    fn release(&self, tile: DeviceTile);

    fn trsm(&self, op: &TriOp, a: &DeviceTile, b: &DeviceTile) -> Result<()>;

    fn trmm(&self, op: &TriOp, a: &DeviceTile, b: &DeviceTile) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriKernel {
    Trsm,
    Trmm,
}

/// Run one triangular cell update on the accelerator: stage both operands,
/// execute, stage the result back into `b`.
pub(crate) fn run_on_device<S: Field>(
    acc: &dyn Accelerator,
    kernel: TriKernel,
    side: Side,
    uplo: Uplo,
    trans: Trans,
    diag: Diag,
    alpha: S,
    a: MatRef<'_, S>,
    mut b: MatMut<'_, S>,
) -> Result<()> {
    if alpha.part(1).unwrap_or(0.0) != 0.0 {
        return Err(Error::Accelerator("complex scaling factors are not supported".into()));
    }
    let op = TriOp {
        side,
        uplo,
        trans,
        diag,
        alpha: alpha.re(),
    };
    let av = a.to_vec();
    let mut bv = b.rb().to_vec();
    let da = acc.stage_in(S::KIND, a.rows(), a.cols(), bytemuck::cast_slice(&av))?;
    let db = match acc.stage_in(S::KIND, b.rows(), b.cols(), bytemuck::cast_slice(&bv)) {
        Ok(db) => db,
        Err(e) => {
            acc.release(da);
            return Err(e);
        }
    };
    let status = match kernel {
        TriKernel::Trsm => acc.trsm(&op, &da, &db),
        TriKernel::Trmm => acc.trmm(&op, &da, &db),
    };
    acc.release(da);
    if let Err(e) = status {
        acc.release(db);
        return Err(e);
    }
    acc.stage_out(db, bytemuck::cast_slice_mut(&mut bv))?;
    let (rows, cols) = (b.rows(), b.cols());
    b.copy_from(MatRef::from_slice(&bv, rows, cols));
    Ok(())
}

fn collect<T: bytemuck::Pod>(data: &[u8]) -> Vec<T> {
    let mut v = vec![T::zeroed(); data.len() / std::mem::size_of::<T>()];
    bytemuck::cast_slice_mut::<T, u8>(&mut v).copy_from_slice(data);
    v
}

enum DeviceData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    C32(Vec<Complex32>),
    C64(Vec<Complex64>),
}

impl DeviceData {
    fn from_bytes(kind: ScalarKind, data: &[u8]) -> Result<Self> {
        Ok(match kind {
            ScalarKind::RealSingle => DeviceData::F32(collect(data)),
            ScalarKind::RealDouble => DeviceData::F64(collect(data)),
            ScalarKind::ComplexSingle => DeviceData::C32(collect(data)),
            ScalarKind::ComplexDouble => DeviceData::C64(collect(data)),
            ScalarKind::Int => {
                return Err(Error::Accelerator("integer tiles are not supported".into()))
            }
        })
    }

    fn bytes(&self) -> &[u8] {
        match self {
            DeviceData::F32(v) => bytemuck::cast_slice(v),
            DeviceData::F64(v) => bytemuck::cast_slice(v),
            DeviceData::C32(v) => bytemuck::cast_slice(v),
            DeviceData::C64(v) => bytemuck::cast_slice(v),
        }
    }
}

fn tri_typed<S: Field>(kernel: TriKernel, op: &TriOp, a: &[S], n: usize, b: &mut [S], rows: usize, cols: usize) {
    let a = MatRef::from_slice(a, n, n);
    let b = MatMut::from_slice(b, rows, cols);
    let alpha = S::from_f64(op.alpha);
    match kernel {
        TriKernel::Trsm => blas::trsm(op.side, op.uplo, op.trans, op.diag, alpha, a, b),
        TriKernel::Trmm => blas::trmm(op.side, op.uplo, op.trans, op.diag, alpha, a, b),
    }
}

/// Device emulator backed by host memory.
pub struct HostAccelerator {
    capacity: usize,
    used: AtomicUsize,
    next_id: AtomicU64,
    memory: Mutex<HashMap<u64, DeviceData>>,
    launches: AtomicUsize,
}

impl HostAccelerator {
    /// An emulated device with `capacity` bytes of memory.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            memory: Mutex::new(HashMap::new()),
            launches: AtomicUsize::new(0),
        }
    }

    /// Number of kernels executed so far.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn bytes_in_use(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, HashMap<u64, DeviceData>> {
        match self.memory.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn launch(&self, kernel: TriKernel, op: &TriOp, a: &DeviceTile, b: &DeviceTile) -> Result<()> {
        if a.kind != b.kind {
            return Err(Error::Accelerator("operands differ in scalar kind".into()));
        }
        let mut mem = self.memory();
        let mut bd = mem
            .remove(&b.id)
            .ok_or_else(|| Error::Accelerator(format!("unknown device tile {}", b.id)))?;
        let status = match mem.get(&a.id) {
            None => Err(Error::Accelerator(format!("unknown device tile {}", a.id))),
            Some(ad) => {
                let n = a.rows;
                match (ad, &mut bd) {
                    (DeviceData::F32(x), DeviceData::F32(y)) => tri_typed(kernel, op, x, n, y, b.rows, b.cols),
                    (DeviceData::F64(x), DeviceData::F64(y)) => tri_typed(kernel, op, x, n, y, b.rows, b.cols),
                    (DeviceData::C32(x), DeviceData::C32(y)) => tri_typed(kernel, op, x, n, y, b.rows, b.cols),
                    (DeviceData::C64(x), DeviceData::C64(y)) => tri_typed(kernel, op, x, n, y, b.rows, b.cols),
                    _ => unreachable!("kinds checked above"),
                }
                Ok(())
            }
        };
        mem.insert(b.id, bd);
        self.launches.fetch_add(1, Ordering::Relaxed);
        status
    }
}

impl Accelerator for HostAccelerator {
    fn stage_in(&self, kind: ScalarKind, rows: usize, cols: usize, data: &[u8]) -> Result<DeviceTile> {
        if data.len() != rows * cols * kind.size_of() {
            return Err(Error::Accelerator(format!(
                "staging {} bytes for a {}x{} {:?} tile",
                data.len(),
                rows,
                cols,
                kind
            )));
        }
        let used = self.used.fetch_add(data.len(), Ordering::AcqRel);
        if used + data.len() > self.capacity {
            self.used.fetch_sub(data.len(), Ordering::AcqRel);
            return Err(Error::Accelerator(format!(
                "out of device memory: {} of {} bytes in use",
                used, self.capacity
            )));
        }
        let d = match DeviceData::from_bytes(kind, data) {
            Ok(d) => d,
            Err(e) => {
                self.used.fetch_sub(data.len(), Ordering::AcqRel);
                return Err(e);
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.memory().insert(id, d);
        Ok(DeviceTile::new(id, kind, rows, cols))
    }

    fn stage_out(&self, tile: DeviceTile, out: &mut [u8]) -> Result<()> {
        let d = self
            .memory()
            .remove(&tile.id)
            .ok_or_else(|| Error::Accelerator(format!("unknown device tile {}", tile.id)))?;
        let bytes = d.bytes();
        self.used.fetch_sub(bytes.len(), Ordering::AcqRel);
        if out.len() != bytes.len() {
            return Err(Error::Accelerator(format!(
                "staging out {} bytes into {}",
                bytes.len(),
                out.len()
            )));
        }
        out.copy_from_slice(bytes);
        Ok(())
    }

    fn release(&self, tile: DeviceTile) {
        if let Some(d) = self.memory().remove(&tile.id) {
            self.used.fetch_sub(d.bytes().len(), Ordering::AcqRel);
        }
    }

    fn trsm(&self, op: &TriOp, a: &DeviceTile, b: &DeviceTile) -> Result<()> {
        self.launch(TriKernel::Trsm, op, a, b)
    }

    fn trmm(&self, op: &TriOp, a: &DeviceTile, b: &DeviceTile) -> Result<()> {
        self.launch(TriKernel::Trmm, op, a, b)
    }
}
