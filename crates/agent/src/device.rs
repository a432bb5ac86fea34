use std::path::Path;

use nvml_wrapper::Nvml;

use crate::manager::PluginBuildError;

/// One enumerated accelerator unit.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelDevice {
    pub index: u32,
    pub uuid: String,
    pub model: String,
}

/// Enumerate the accelerator devices visible to the driver.
pub fn enumerate(driver_root: &Path) -> Result<Vec<AccelDevice>, PluginBuildError> {
    let nvml = init_driver(driver_root)?;

    let device_count = nvml.device_count().map_err(query_err)?;
    tracing::info!("Discovered {} accelerator device(s)", device_count);

    let mut devices = Vec::with_capacity(device_count as usize);
    for i in 0..device_count {
        let device = nvml.device_by_index(i).map_err(query_err)?;
        let uuid = device.uuid().map_err(query_err)?.to_lowercase();
        let model = device.name().map_err(query_err)?;

        tracing::info!("Found device {}: {} ({})", i, uuid, model);
        devices.push(AccelDevice {
            index: i,
            uuid,
            model,
        });
    }

    Ok(devices)
}

fn init_driver(driver_root: &Path) -> Result<Nvml, PluginBuildError> {
    match Nvml::init() {
        Ok(nvml) => {
            tracing::info!("Management library initialized");
            Ok(nvml)
        }
        Err(_) => {
            tracing::warn!("Standard library init failed, trying under the driver root");
            let lib_path = driver_root.join("usr/lib/x86_64-linux-gnu/libnvidia-ml.so.1");
            let nvml = Nvml::builder()
                .lib_path(lib_path.as_os_str())
                .init()
                .map_err(|source| PluginBuildError::DriverInit { source })?;
            tracing::info!("Management library initialized from {:?}", lib_path);
            Ok(nvml)
        }
    }
}

fn query_err(source: nvml_wrapper::error::NvmlError) -> PluginBuildError {
    PluginBuildError::DeviceQuery { source }
}
