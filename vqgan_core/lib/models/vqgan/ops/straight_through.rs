use candle_core::cpu_backend::unary_map;
use candle_core::{bail, CpuStorage, CustomOp2, Layout, Result, Shape, Tensor};

/// Identity-gradient op over `(continuous, quantized)`.
///
/// Forward returns a copy of `quantized`; backward hands the incoming gradient
/// to `continuous` unchanged and nothing to `quantized`. This is the
/// straight-through estimator used to train through the codebook argmin.
#[derive(Debug, Clone)]
pub struct StraightThrough;

fn gather<T: Copy>(vs: &[T], layout: &Layout) -> Vec<T> {
    unary_map(vs, layout, |v| v)
}

impl CustomOp2 for StraightThrough {
    fn name(&self) -> &'static str {
        "straight_through"
    }

    fn cpu_fwd(
        &self,
        _s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        if l1.shape() != l2.shape() {
            bail!(
                "straight_through: shape mismatch {:?} vs {:?}",
                l1.shape(),
                l2.shape()
            );
        }
        let storage = match s2 {
            CpuStorage::F32(vs) => CpuStorage::F32(gather(vs, l2)),
            CpuStorage::F64(vs) => CpuStorage::F64(gather(vs, l2)),
            CpuStorage::F16(vs) => CpuStorage::F16(gather(vs, l2)),
            CpuStorage::BF16(vs) => CpuStorage::BF16(gather(vs, l2)),
            _ => bail!("straight_through: only float tensors are supported"),
        };
        Ok((storage, l2.shape().clone()))
    }

    #[cfg(feature = "cuda")]
    fn cuda_fwd(
        &self,
        _s1: &candle_core::CudaStorage,
        l1: &Layout,
        s2: &candle_core::CudaStorage,
        l2: &Layout,
    ) -> Result<(candle_core::CudaStorage, Shape)> {
        use candle_core::backend::BackendStorage;

        if l1.shape() != l2.shape() {
            bail!("straight_through: shape mismatch");
        }
        if !l2.is_contiguous() || l2.start_offset() != 0 {
            bail!("straight_through: quantized input has to be contiguous");
        }
        Ok((s2.try_clone(l2)?, l2.shape().clone()))
    }

    #[cfg(feature = "metal")]
    fn metal_fwd(
        &self,
        _s1: &candle_core::MetalStorage,
        l1: &Layout,
        s2: &candle_core::MetalStorage,
        l2: &Layout,
    ) -> Result<(candle_core::MetalStorage, Shape)> {
        use candle_core::backend::BackendStorage;

        if l1.shape() != l2.shape() {
            bail!("straight_through: shape mismatch");
        }
        if !l2.is_contiguous() || l2.start_offset() != 0 {
            bail!("straight_through: quantized input has to be contiguous");
        }
        Ok((s2.try_clone(l2)?, l2.shape().clone()))
    }

    fn bwd(
        &self,
        _arg1: &Tensor,
        _arg2: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        Ok((Some(grad_res.clone()), None))
    }
}

/// Forward value of `quantized`, gradient routed to `continuous`.
///
/// `quantized` is detached so the backward graph never waits on a gradient
/// for it through this op.
pub fn straight_through(continuous: &Tensor, quantized: &Tensor) -> Result<Tensor> {
    continuous.apply_op2(&quantized.detach().contiguous()?, StraightThrough)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn test_forward_returns_quantized() {
        let device = Device::Cpu;
        let z = Tensor::new(&[[0.1f32, 0.9], [2.2, -1.0]], &device).unwrap();
        let q = Tensor::new(&[[0f32, 1.0], [2.0, -1.0]], &device).unwrap();

        let out = straight_through(&z, &q).unwrap();
        assert_eq!(out.shape(), q.shape());
        assert_eq!(out.to_vec2::<f32>().unwrap(), q.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_forward_handles_strided_quantized() {
        let device = Device::Cpu;
        let z = Tensor::zeros((3, 2), candle_core::DType::F32, &device).unwrap();
        let q = Tensor::new(&[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &device).unwrap();
        let q_t = q.t().unwrap();

        let out = z.apply_op2(&q_t, StraightThrough).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 4.0], vec![2.0, 5.0], vec![3.0, 6.0]]
        );
    }

    #[test]
    fn test_forward_handles_offset_quantized() {
        let device = Device::Cpu;
        let z = Tensor::zeros((2, 2), candle_core::DType::F32, &device).unwrap();
        let q = Tensor::arange(0f32, 12.0, &device)
            .unwrap()
            .reshape((4, 3))
            .unwrap();
        // rows 1..3, columns 1..3: non-zero start offset and a row stride of 3
        let window = q.narrow(0, 1, 2).unwrap().narrow(1, 1, 2).unwrap();

        let out = z.apply_op2(&window, StraightThrough).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![4.0, 5.0], vec![7.0, 8.0]]
        );
    }

    #[test]
    fn test_gradient_is_copied_to_continuous() {
        let device = Device::Cpu;
        let z = Var::new(&[1.5f32, -0.25, 3.0], &device).unwrap();
        let q = Var::new(&[1f32, 0.0, 3.0], &device).unwrap();
        let weights = Tensor::new(&[2f32, -3.0, 0.5], &device).unwrap();

        let out = straight_through(z.as_tensor(), q.as_tensor()).unwrap();
        let loss = out.mul(&weights).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let dz = grads.get(z.as_tensor()).unwrap();
        assert_eq!(dz.to_vec1::<f32>().unwrap(), vec![2.0, -3.0, 0.5]);
        assert!(grads.get(q.as_tensor()).is_none());
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let device = Device::Cpu;
        let z = Tensor::zeros(3, candle_core::DType::F32, &device).unwrap();
        let q = Tensor::zeros(4, candle_core::DType::F32, &device).unwrap();
        assert!(straight_through(&z, &q).is_err());
    }
}
