use crate::error::{Result, VqError};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::Path;

/// Outcome of a non-strict restore. Nothing in here is treated as an error.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// Model variables with no tensor in the checkpoint
    pub missing: Vec<String>,
    /// Checkpoint tensors with no model variable
    pub unexpected: Vec<String>,
    /// Present on both sides with different shapes; left untouched
    pub mismatched: Vec<String>,
}

fn read_tensors(path: &Path) -> Result<HashMap<String, Tensor>> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => Ok(candle_core::safetensors::load(path, &Device::Cpu)?),
        Some("pth") | Some("pt") | Some("ckpt") => {
            Ok(candle_core::pickle::read_all(path)?.into_iter().collect())
        }
        _ => Err(VqError::UnsupportedCheckpoint(path.to_path_buf())),
    }
}

/// Copy every same-named, same-shaped tensor into `varmap`.
pub fn restore(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<LoadReport> {
    let data = varmap.data().lock().map_err(|_| VqError::PoisonedVarMap)?;
    let mut report = LoadReport::default();

    for (name, var) in data.iter() {
        match tensors.get(name) {
            Some(tensor) if tensor.dims() == var.dims() => {
                let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
                var.set(&tensor)?;
                report.loaded += 1;
            }
            Some(_) => report.mismatched.push(name.clone()),
            None => report.missing.push(name.clone()),
        }
    }
    report.unexpected = tensors
        .keys()
        .filter(|name| !data.contains_key(*name))
        .cloned()
        .collect();

    report.missing.sort();
    report.unexpected.sort();
    report.mismatched.sort();
    Ok(report)
}

/// Restore model variables from a `.safetensors` or torch pickle checkpoint, tolerating
/// missing, extra and mis-shaped entries.
pub fn load_checkpoint_non_strict<P: AsRef<Path>>(varmap: &VarMap, path: P) -> Result<LoadReport> {
    let path = path.as_ref();
    let tensors = read_tensors(path)?;
    let report = restore(varmap, &tensors)?;

    for name in report.missing.iter() {
        tracing::debug!("missing key {}", name);
    }
    for name in report.unexpected.iter() {
        tracing::debug!("unexpected key {}", name);
    }
    for name in report.mismatched.iter() {
        tracing::debug!("shape mismatch for {}, keeping initialisation", name);
    }
    tracing::info!("Restored from {}", path.display());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn varmap_with_two_vars(device: &Device) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        vb.get_with_hints((2, 2), "a.weight", Init::Const(0.0)).unwrap();
        vb.get_with_hints(3, "b.bias", Init::Const(0.0)).unwrap();
        varmap
    }

    #[test]
    fn test_restore_reports_key_differences() {
        let device = Device::Cpu;
        let varmap = varmap_with_two_vars(&device);

        let mut tensors = HashMap::new();
        tensors.insert(
            "a.weight".to_string(),
            Tensor::new(&[[1f64, 2.0], [3.0, 4.0]], &device).unwrap(),
        );
        tensors.insert("b.bias".to_string(), Tensor::ones(4, DType::F32, &device).unwrap());
        tensors.insert("loss.logvar".to_string(), Tensor::ones(1, DType::F32, &device).unwrap());

        let report = restore(&varmap, &tensors).unwrap();
        assert_eq!(report.loaded, 1);
        assert!(report.missing.is_empty());
        assert_eq!(report.unexpected, vec!["loss.logvar".to_string()]);
        assert_eq!(report.mismatched, vec!["b.bias".to_string()]);

        let data = varmap.data().lock().unwrap();
        let a = data.get("a.weight").unwrap();
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(
            a.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
        let b = data.get("b.bias").unwrap();
        assert_eq!(b.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_safetensors_round_trip() {
        let device = Device::Cpu;
        let varmap = varmap_with_two_vars(&device);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert("b.bias".to_string(), Tensor::new(&[7f32, 8.0, 9.0], &device).unwrap());
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let report = load_checkpoint_non_strict(&varmap, &path).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.missing, vec!["a.weight".to_string()]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(
            data.get("b.bias").unwrap().to_vec1::<f32>().unwrap(),
            vec![7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn test_torch_pickle_restore() {
        // written by fixtures/make_partial_pth.py in the `torch.save` zip layout
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/partial.pth");
        let device = Device::Cpu;
        let varmap = varmap_with_two_vars(&device);

        let report = load_checkpoint_non_strict(&varmap, path).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.missing, vec!["b.bias".to_string()]);
        assert_eq!(report.unexpected, vec!["extra.weight".to_string()]);
        assert!(report.mismatched.is_empty());

        let data = varmap.data().lock().unwrap();
        assert_eq!(
            data.get("a.weight").unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let varmap = VarMap::new();
        let err = load_checkpoint_non_strict(&varmap, "weights.bin").unwrap_err();
        assert!(matches!(err, VqError::UnsupportedCheckpoint(_)));
    }

    #[test]
    fn test_missing_file_propagates() {
        let varmap = VarMap::new();
        assert!(load_checkpoint_non_strict(&varmap, "no/such/model.safetensors").is_err());
    }
}
