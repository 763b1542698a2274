use gortms::config::Config;
use gortms::Core;
use tempfile::TempDir;

/// A fresh `Core` backed by a throwaway data directory — each test gets
/// its own encrypted secure-store files and its own `SYSTEM` domain.
pub fn setup_core() -> (Core, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.secure.data_dir = temp_dir.path().to_str().unwrap().to_string();
    config.secure.argon2_memory_kib = 256;
    config.secure.argon2_iterations = 1;
    config.secure.argon2_parallelism = 1;

    let core = Core::new(config).unwrap();
    (core, temp_dir)
}
