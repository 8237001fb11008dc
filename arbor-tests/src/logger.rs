use log::LevelFilter;

/// Initialize test logging. Safe to call from every test.
pub fn init() {
    env_logger::builder()
        .is_test(true)
        .filter_level(LevelFilter::Debug)
        .try_init()
        .ok();
}
