use std::time::Instant;

use super::timing::TimerStart;
use super::{CompiledKernel, DataId, GpgpuBackend};
use crate::device::TextureId;
use crate::error::{BackendError, BackendResult};
use crate::layout::{size_from_shape, texture_shape_from_logical};
use crate::profiling;
use crate::programs::{KernelDescriptor, KernelSignature, KernelSource, OperandLayout, ParamBinding};

impl GpgpuBackend {
    /// Moves a record's host values into a texture.
    ///
    /// A record that already has a texture is left alone. The host copy is
    /// dropped once the upload succeeds.
    pub(crate) fn upload_to_device(&mut self, id: DataId) -> BackendResult<()> {
        let record = self.table.get(id)?;
        if record.texture.is_some() {
            return Ok(());
        }
        let Some(values) = record.values.as_ref() else {
            return Err(BackendError::Uninitialized { handle: id });
        };
        let texels = values.to_f32_vec();
        let packing = record.packing;
        let shape = texture_shape_from_logical(&record.shape, self.caps.max_texture_size)?;

        let start = self.timers.is_active().then(Instant::now);
        let texture = self.pool.acquire(self.device.as_ref(), shape, packing)?;
        if let Err(err) = self.device.upload_matrix(texture, shape, &texels) {
            self.pool.release(texture, shape, packing);
            return Err(err);
        }
        if let Some(start) = start {
            self.timers.add_upload_wait(start);
        }

        let record = self.table.get_mut(id)?;
        record.texture = Some(texture);
        record.texture_shape = Some(shape);
        record.values = None;
        Ok(())
    }

    /// Gives an output record a texture for its physical layout, dropping any
    /// host values the kernel is about to overwrite.
    fn allocate_output(&mut self, id: DataId) -> BackendResult<()> {
        let record = self.table.get(id)?;
        let shape = texture_shape_from_logical(&record.shape, self.caps.max_texture_size)?;
        let packing = record.packing;
        if record.texture.is_some() && record.texture_shape == Some(shape) {
            self.table.get_mut(id)?.values = None;
            return Ok(());
        }
        let texture = self.pool.acquire(self.device.as_ref(), shape, packing)?;
        let record = self.table.get_mut(id)?;
        let previous = record.texture.replace(texture).zip(record.texture_shape.replace(shape));
        record.values = None;
        if let Some((old, old_shape)) = previous {
            self.pool.release(old, old_shape, packing);
        }
        Ok(())
    }

    fn operand_layout(&self, id: DataId) -> BackendResult<OperandLayout> {
        let record = self.table.get(id)?;
        let texture_shape = match record.texture_shape {
            Some(shape) => shape,
            None => texture_shape_from_logical(&record.shape, self.caps.max_texture_size)?,
        };
        Ok(OperandLayout {
            shape: record.shape.clone(),
            texture_shape,
            dtype: record.dtype,
            packing: record.packing,
        })
    }

    /// Runs one kernel and returns the handle holding its result.
    ///
    /// When `output` is `None` a record is created from the descriptor; that
    /// record is disposed again if any later step fails. Uploaded inputs stay
    /// resident either way.
    pub fn run(
        &mut self,
        descriptor: KernelDescriptor,
        inputs: &[DataId],
        output: Option<DataId>,
        binding: &ParamBinding,
    ) -> BackendResult<DataId> {
        let _scope = profiling::backend_scope("texflow.dispatch");
        if let Some(id) = output {
            self.check_output(id, &descriptor)?;
        }
        for &input in inputs {
            self.upload_to_device(input)?;
        }

        let (output, created) = match output {
            Some(id) => (id, false),
            None => {
                let dtype = match (descriptor.output_dtype, inputs.first()) {
                    (Some(dtype), _) => dtype,
                    (None, Some(&first)) => self.table.get(first)?.dtype,
                    (None, None) => {
                        return Err(BackendError::invalid(
                            descriptor.op.name(),
                            "kernel without inputs needs an explicit output dtype",
                        ))
                    }
                };
                (self.make_tensor(&descriptor.output_shape, dtype)?, true)
            }
        };

        match self.launch(descriptor, inputs, output, binding) {
            Ok(()) => Ok(output),
            Err(err) => {
                if created {
                    if let Err(cleanup) = self.dispose_data(output) {
                        tracing::warn!(
                            %output,
                            error = %cleanup,
                            "failed to roll back kernel output"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// A caller-supplied output must already have the kernel's logical shape
    /// and, when the kernel fixes one, its dtype.
    fn check_output(&self, id: DataId, descriptor: &KernelDescriptor) -> BackendResult<()> {
        let record = self.table.get(id)?;
        if record.shape != descriptor.output_shape {
            return Err(BackendError::ShapeMismatch {
                context: format!(
                    "{} output {id} has shape {:?}, kernel writes {:?}",
                    descriptor.op.name(),
                    record.shape,
                    descriptor.output_shape
                ),
                expected: size_from_shape(&descriptor.output_shape),
                found: record.size(),
            });
        }
        match descriptor.output_dtype {
            Some(expected) if expected != record.dtype => Err(BackendError::DTypeMismatch {
                handle: id,
                expected,
                found: record.dtype,
            }),
            _ => Ok(()),
        }
    }

    fn launch(
        &mut self,
        descriptor: KernelDescriptor,
        inputs: &[DataId],
        output: DataId,
        binding: &ParamBinding,
    ) -> BackendResult<()> {
        self.allocate_output(output)?;

        let input_layouts = inputs
            .iter()
            .map(|&id| self.operand_layout(id))
            .collect::<BackendResult<Vec<_>>>()?;
        let signature = KernelSignature {
            op: descriptor.op,
            inputs: input_layouts,
            output: self.operand_layout(output)?,
        };
        let params = descriptor.params;
        let device = self.device.as_ref();
        let kernel = self.kernels.compile_or_get(signature, |signature| {
            let program = device.compile_program(&KernelSource {
                signature: signature.clone(),
                params,
            })?;
            Ok(CompiledKernel {
                program,
                signature: signature.clone(),
                params,
            })
        })?;
        kernel.params.check(binding)?;

        let textures = inputs
            .iter()
            .map(|&id| self.resident_texture(id))
            .collect::<BackendResult<Vec<_>>>()?;
        let target = self.resident_texture(output)?;

        let timer = if self.timers.is_active() {
            Some(TimerStart::begin(self.device.as_ref(), &self.caps)?)
        } else {
            None
        };
        let ran = self
            .device
            .run_program(kernel.program, &textures, target, binding);
        // The query must be closed even when the run failed.
        if let Some(timer) = timer {
            let pending = timer.end(self.device.as_ref())?;
            ran?;
            self.timers.record_kernel(pending);
            return Ok(());
        }
        ran
    }

    fn resident_texture(&self, id: DataId) -> BackendResult<TextureId> {
        self.table
            .get(id)?
            .texture
            .ok_or(BackendError::Uninitialized { handle: id })
    }
}
