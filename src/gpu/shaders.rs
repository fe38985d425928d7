/// Point scatter for filtro and group: one point per source element,
/// positioned on its destination pixel of an `R32Sint` target.
pub const SCATTER: &str = include_str!("shaders/scatter.wgsl");

/// Row-major copy of an `R32Sint` target into a storage buffer, for widths
/// whose row pitch cannot be copied directly.
pub const RELINEARIZE: &str = include_str!("shaders/relinearize.wgsl");
