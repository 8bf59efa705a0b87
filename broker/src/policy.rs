//! Device allowlist: which device nodes the broker will hand to the
//! unprivileged side.
//!
//! Classification is by device major number only, independent of the
//! filesystem permission bits on the requested path. The renderer needs
//! exactly two classes, evdev input nodes and DRM nodes; everything else,
//! including ordinary files (`st_rdev` of zero), is disallowed.

/// `INPUT_MAJOR` from `<linux/major.h>`.
pub const INPUT_MAJOR: u32 = 13;

/// The major the DRM subsystem registers its character devices under.
pub const DRM_MAJOR: u32 = 226;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Input,
    Drm,
    Disallowed,
}

pub fn classify_major(major: u32) -> DeviceClass {
    match major {
        INPUT_MAJOR => DeviceClass::Input,
        DRM_MAJOR => DeviceClass::Drm,
        _ => DeviceClass::Disallowed,
    }
}

/// Classifies the `st_rdev` of a freshly opened descriptor.
pub fn classify_rdev(rdev: libc::dev_t) -> DeviceClass {
    classify_major(libc::major(rdev))
}
