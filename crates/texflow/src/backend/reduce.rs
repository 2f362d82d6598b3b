use super::{DataId, GpgpuBackend};
use crate::dtype::{DType, TensorData};
use crate::error::{BackendError, BackendResult};
use crate::layout::size_from_shape;
use crate::programs::reduce::{arg_reduce_descriptor, reduce_descriptor, split_innermost};
use crate::programs::{ArgReduceOp, ParamBinding, ReduceOp};

impl GpgpuBackend {
    /// Sums over the innermost `axes`. Integral and boolean inputs sum to `i32`.
    pub fn sum(&mut self, x: DataId, axes: &[usize]) -> BackendResult<DataId> {
        self.reduce(ReduceOp::Sum, x, axes)
    }

    pub fn min(&mut self, x: DataId, axes: &[usize]) -> BackendResult<DataId> {
        self.reduce(ReduceOp::Min, x, axes)
    }

    pub fn max(&mut self, x: DataId, axes: &[usize]) -> BackendResult<DataId> {
        self.reduce(ReduceOp::Max, x, axes)
    }

    /// Index of the smallest element over the innermost `axes`; ties resolve
    /// to the first occurrence.
    pub fn arg_min(&mut self, x: DataId, axes: &[usize]) -> BackendResult<DataId> {
        self.arg_reduce(ArgReduceOp::Min, x, axes)
    }

    pub fn arg_max(&mut self, x: DataId, axes: &[usize]) -> BackendResult<DataId> {
        self.arg_reduce(ArgReduceOp::Max, x, axes)
    }

    fn reduce(&mut self, op: ReduceOp, x: DataId, axes: &[usize]) -> BackendResult<DataId> {
        let shape = self.shape(x)?;
        let (outer, inner) = split_innermost(op.name(), &shape, axes)?;
        let output_dtype = op.output_dtype(self.dtype(x)?);
        if inner == 0 {
            if op != ReduceOp::Sum {
                return Err(BackendError::invalid(op.name(), "cannot reduce an empty axis"));
            }
            let zeros = TensorData::zeros(output_dtype, size_from_shape(&outer));
            return self.make_tensor_with(&outer, zeros);
        }
        let batch = size_from_shape(&outer);
        let mut scratch = Vec::new();
        let result = self.reduce_passes(op, x, [batch, inner], output_dtype, &mut scratch);
        self.dispose_scratch(scratch)?;
        let result = result?;
        self.relabel_shape(result, &outer)?;
        Ok(result)
    }

    fn reduce_passes(
        &mut self,
        op: ReduceOp,
        x: DataId,
        view: [usize; 2],
        output_dtype: DType,
        scratch: &mut Vec<DataId>,
    ) -> BackendResult<DataId> {
        let mut current = self.reshape(x, &view)?;
        let mut shape = view.to_vec();
        loop {
            scratch.push(current);
            let descriptor = reduce_descriptor(op, &shape, output_dtype)?;
            shape = descriptor.output_shape.clone();
            let next = self.run(descriptor, &[current], None, &ParamBinding::None)?;
            tracing::trace!(op = op.name(), ?shape, "reduction pass");
            if shape[1] == 1 {
                return Ok(next);
            }
            current = next;
        }
    }

    fn arg_reduce(&mut self, op: ArgReduceOp, x: DataId, axes: &[usize]) -> BackendResult<DataId> {
        let shape = self.shape(x)?;
        let (outer, inner) = split_innermost(op.name(), &shape, axes)?;
        if inner == 0 {
            return Err(BackendError::invalid(op.name(), "cannot reduce an empty axis"));
        }
        let batch = size_from_shape(&outer);
        let mut scratch = Vec::new();
        let result = self.arg_reduce_passes(op, x, [batch, inner], &mut scratch);
        self.dispose_scratch(scratch)?;
        let result = result?;
        self.relabel_shape(result, &outer)?;
        Ok(result)
    }

    /// Later passes read the original values through the previous pass's
    /// best indices.
    fn arg_reduce_passes(
        &mut self,
        op: ArgReduceOp,
        x: DataId,
        view: [usize; 2],
        scratch: &mut Vec<DataId>,
    ) -> BackendResult<DataId> {
        let values = self.reshape(x, &view)?;
        scratch.push(values);
        let descriptor = arg_reduce_descriptor(op, &view, None)?;
        let mut best_shape = descriptor.output_shape.clone();
        let mut best = self.run(descriptor, &[values], None, &ParamBinding::None)?;
        while best_shape[1] > 1 {
            scratch.push(best);
            let descriptor = arg_reduce_descriptor(op, &view, Some(&best_shape))?;
            best_shape = descriptor.output_shape.clone();
            best = self.run(descriptor, &[values, best], None, &ParamBinding::None)?;
        }
        Ok(best)
    }

    fn dispose_scratch(&mut self, scratch: Vec<DataId>) -> BackendResult<()> {
        for id in scratch {
            self.dispose_data(id)?;
        }
        Ok(())
    }

    /// Gives a record a new logical shape of the same size, keeping its
    /// physical layout.
    fn relabel_shape(&mut self, id: DataId, shape: &[usize]) -> BackendResult<()> {
        let record = self.table.get_mut(id)?;
        if size_from_shape(&record.shape) != size_from_shape(shape) {
            return Err(BackendError::ShapeMismatch {
                context: format!("relabel {id} from {:?} to {shape:?}", record.shape),
                expected: size_from_shape(&record.shape),
                found: size_from_shape(shape),
            });
        }
        record.shape = shape.to_vec();
        Ok(())
    }
}
