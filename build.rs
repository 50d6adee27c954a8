use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    shift: u8,
    capacities: Vec<u16>,
}

const MIN_SHIFT: u8 = 12;
const MAX_SHIFT: u8 = 18;

fn validate(cfg: &Config) {
    assert!(
        (MIN_SHIFT..=MAX_SHIFT).contains(&cfg.shift),
        "shift ({}) must be in {}..={}",
        cfg.shift,
        MIN_SHIFT,
        MAX_SHIFT
    );
    assert!(
        cfg.capacities.len() >= 2,
        "need at least one size class besides the reserved class 0"
    );
    assert!(
        cfg.capacities.len() <= 512,
        "too many size classes ({}, max 512)",
        cfg.capacities.len()
    );
    assert_eq!(cfg.capacities[0], 0, "class 0 is reserved; capacity must be 0");

    // Re-run the region layout: headers, one begin-mark cell per run of
    // non-empty classes, then the slot windows. Everything is 8-byte cells.
    let mut cells = cfg.capacities.len();
    let mut prev_empty = false;
    for (class, &cap) in cfg.capacities.iter().enumerate().skip(1) {
        if !prev_empty {
            cells += 1;
        }
        prev_empty = cap == 0;
        cells += cap as usize;
        assert!(
            cells * 8 <= 1usize << cfg.shift,
            "class {} overflows the per-CPU region: need {} bytes, have {}",
            class,
            cells * 8,
            1usize << cfg.shift
        );
    }
    assert!(cells <= u16::MAX as usize, "cell offsets must fit in u16");
}

fn generate(cfg: &Config, out_path: &Path) {
    let num_classes = cfg.capacities.len();
    let mut code = String::from("// Auto-generated by build.rs from slab.toml. Do not edit.\n\n");
    code.push_str(&format!(
        "/// Default log2 of the per-CPU region size.\n\
         pub const DEFAULT_SHIFT: u8 = {};\n\n\
         /// Number of size classes in the default table (class 0 reserved).\n\
         pub const NUM_CLASSES: usize = {};\n\n\
         /// Default per-class capacity ceilings, in objects.\n\
         pub static CAPACITIES: [u16; {}] = [\n",
        cfg.shift, num_classes, num_classes
    ));
    for &cap in &cfg.capacities {
        code.push_str(&format!("    {cap},\n"));
    }
    code.push_str("];\n");
    fs::write(out_path, code).expect("failed to write defaults_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=SLAB_CONFIG");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let config_path =
        env::var("SLAB_CONFIG").unwrap_or_else(|_| format!("{manifest_dir}/slab.toml"));
    println!("cargo:rerun-if-changed={config_path}");

    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {config_path}: {e}"));
    let config: Config = toml::from_str(&content).expect("failed to parse slab.toml");

    validate(&config);

    let out_dir = env::var("OUT_DIR").unwrap();
    generate(&config, &Path::new(&out_dir).join("defaults_gen.rs"));
}
