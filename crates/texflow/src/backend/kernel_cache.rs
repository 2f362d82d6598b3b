use std::collections::HashMap;
use std::sync::Arc;

use crate::device::{GpgpuDevice, ProgramId};
use crate::error::BackendResult;
use crate::profiling;
use crate::programs::{KernelSignature, ParamKind};

/// A device program specialised for one kernel signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledKernel {
    pub program: ProgramId,
    pub signature: KernelSignature,
    pub params: ParamKind,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KernelCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Compiled kernels memoised by structural signature.
///
/// Entries live until [`KernelCache::dispose`], which deletes their programs.
#[derive(Default)]
pub(crate) struct KernelCache {
    entries: HashMap<KernelSignature, Arc<CompiledKernel>>,
    hits: u64,
    misses: u64,
}

impl KernelCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn compile_or_get<F>(
        &mut self,
        signature: KernelSignature,
        compile: F,
    ) -> BackendResult<Arc<CompiledKernel>>
    where
        F: FnOnce(&KernelSignature) -> BackendResult<CompiledKernel>,
    {
        if let Some(found) = self.entries.get(&signature) {
            profiling::cache_event("texflow.kernel_hit");
            self.hits += 1;
            return Ok(Arc::clone(found));
        }
        profiling::cache_event("texflow.kernel_miss");
        let compiled = {
            let _compile_scope = profiling::compile_scope("texflow.compile");
            Arc::new(compile(&signature)?)
        };
        tracing::debug!(
            op = signature.op.name(),
            program = %compiled.program,
            inputs = signature.inputs.len(),
            "compiled kernel"
        );
        self.misses += 1;
        self.entries.insert(signature, Arc::clone(&compiled));
        Ok(compiled)
    }

    pub(crate) fn stats(&self) -> KernelCacheStats {
        KernelCacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }

    pub(crate) fn dispose(&mut self, device: &dyn GpgpuDevice) -> BackendResult<()> {
        let mut first_err = None;
        for (_, kernel) in self.entries.drain() {
            if let Err(err) = device.delete_program(kernel.program) {
                first_err.get_or_insert(err);
            }
        }
        self.hits = 0;
        self.misses = 0;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
