//! Computer build payloads for write traffic

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};

pub const GPU_MODELS: &[&str] = &[
    "GeForce RTX 4090",
    "GeForce RTX 4080 SUPER",
    "GeForce RTX 4070 Ti GAMING X TRIO",
    "GeForce RTX 3090 Ti",
    "Radeon RX 7900 XTX",
    "Radeon RX 7800 XT",
    "GeForce RTX 3060 Ti",
    "Intel Arc A770",
];

pub const RAM_CAPACITIES_GB: &[u32] = &[16, 32, 64, 128, 256];

const SOCKETS: &[&str] = &["AM5", "AM4", "LGA1700", "LGA1851"];
const CHIPSETS: &[&str] = &["X670E", "B650", "Z790", "Z890", "B760"];
const STORAGE_GB: &[u32] = &[512, 1000, 2000, 4000];

/// Random alphanumeric suffix
pub fn random_suffix<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
}

/// Fresh record name such as `PC-LOAD-a8F2k0Qz1c`
pub fn unique_name<R: Rng + ?Sized>(rng: &mut R, prefix: &str) -> String {
    format!("{}-{}", prefix, random_suffix(rng, 10))
}

/// Build a computer description with a random GPU
pub fn computer<R: Rng + ?Sized>(rng: &mut R, name: &str) -> Value {
    let gpu = GPU_MODELS.choose(rng).copied().unwrap_or("GeForce RTX 4090");
    computer_with_gpu(rng, name, gpu)
}

/// Build a computer description whose GPU model is `gpu_model`
pub fn computer_with_gpu<R: Rng + ?Sized>(rng: &mut R, name: &str, gpu_model: &str) -> Value {
    let ram_gb = *RAM_CAPACITIES_GB.choose(rng).unwrap_or(&32);
    let modules = if ram_gb >= 128 { 4 } else { 2 };
    let storage_gb = *STORAGE_GB.choose(rng).unwrap_or(&1000);

    json!({
        "name": name,
        "price": rng.gen_range(2500..=35000),
        "fonte": {
            "modelo": "RM850x",
            "potencia_watts": 850,
            "certificacao": "80 Plus Gold",
            "modular": true
        },
        "placa_mae": {
            "socket": SOCKETS.choose(rng).copied().unwrap_or("AM5"),
            "chipset": CHIPSETS.choose(rng).copied().unwrap_or("B650"),
            "formato": "ATX"
        },
        "placa_video": {
            "modelo": gpu_model,
            "memoria_gb": 16,
            "tipo_memoria": "GDDR6X"
        },
        "memoria_ram": {
            "modulos": (0..modules).map(|_| json!({
                "capacidade_gb": ram_gb / modules,
                "tipo": "DDR5",
                "frequencia_mhz": 6000
            })).collect::<Vec<_>>(),
            "capacidade_total_gb": ram_gb
        },
        "armazenamento": {
            "dispositivos": [{ "tipo": "NVMe", "capacidade_gb": storage_gb }],
            "capacidade_total_gb": storage_gb
        },
        "observacoes": format!("Load test build {}", name)
    })
}
