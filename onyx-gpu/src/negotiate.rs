//! Request-versus-supported filtering for layers and extensions.

use std::ffi::CStr;

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    InstanceLayer,
    InstanceExtension,
    DeviceExtension,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CapabilityKind::InstanceLayer => "instance layer",
            CapabilityKind::InstanceExtension => "instance extension",
            CapabilityKind::DeviceExtension => "device extension",
        })
    }
}

/// Keep the entries of `requested` that appear in `supported`.
///
/// The result follows request order, holds no duplicates, and never
/// contains a name absent from either list. Accepted entries are
/// logged on the validation channel, rejected ones as warnings.
pub fn negotiate<'a>(
    kind: CapabilityKind,
    requested: &[&'a CStr],
    supported: &[&CStr],
) -> Vec<&'a CStr> {
    let mut enabled: Vec<&'a CStr> = Vec::with_capacity(requested.len());
    for &name in requested {
        if enabled.contains(&name) {
            continue;
        }
        if supported.contains(&name) {
            onyx_log::validation!(
                "Vulkan",
                "Enabling {kind} {}",
                name.to_string_lossy()
            );
            enabled.push(name);
        } else {
            tracing::warn!(
                "Requested {kind} {} is not supported",
                name.to_string_lossy()
            );
        }
    }
    enabled
}

pub fn extension_names(props: &[vk::ExtensionProperties]) -> Vec<&CStr> {
    props
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok())
        .collect()
}

pub fn layer_names(props: &[vk::LayerProperties]) -> Vec<&CStr> {
    props
        .iter()
        .filter_map(|p| p.layer_name_as_c_str().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use onyx_log::{ConsoleLayer, MemoryWriter, SeverityFlags};
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    const VALIDATION: &CStr = c"VK_LAYER_KHRONOS_validation";
    const DEBUG_UTILS: &CStr = c"VK_EXT_debug_utils";
    const SURFACE: &CStr = c"VK_KHR_surface";
    const MISSING: &CStr = c"VK_EXT_not_a_real_extension";

    #[test]
    fn keeps_request_order_not_supported_order() {
        let enabled = negotiate(
            CapabilityKind::InstanceExtension,
            &[SURFACE, DEBUG_UTILS],
            &[DEBUG_UTILS, VALIDATION, SURFACE],
        );
        assert_eq!(enabled, [SURFACE, DEBUG_UTILS]);
    }

    #[test]
    fn result_is_a_deduplicated_subset_of_both_lists() {
        let requested = [DEBUG_UTILS, MISSING, DEBUG_UTILS, SURFACE, MISSING];
        let supported = [SURFACE, DEBUG_UTILS];
        let enabled = negotiate(
            CapabilityKind::DeviceExtension,
            &requested,
            &supported,
        );

        assert_eq!(enabled, [DEBUG_UTILS, SURFACE]);
        for name in &enabled {
            assert!(requested.contains(name));
            assert!(supported.contains(name));
            assert_eq!(enabled.iter().filter(|n| *n == name).count(), 1);
        }
    }

    #[test]
    fn empty_inputs_negotiate_to_nothing() {
        assert!(
            negotiate(CapabilityKind::InstanceLayer, &[], &[VALIDATION])
                .is_empty()
        );
        assert!(
            negotiate(CapabilityKind::InstanceLayer, &[VALIDATION], &[])
                .is_empty()
        );
    }

    #[test]
    fn logs_accepted_and_rejected_entries() {
        let out = MemoryWriter::default();
        let layer = ConsoleLayer::new(SeverityFlags::ALL)
            .with_ansi(false)
            .to_writer(out.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            negotiate(
                CapabilityKind::InstanceLayer,
                &[VALIDATION, MISSING],
                &[VALIDATION],
            );
        });

        let text = out.contents();
        assert!(text.contains(
            "[Vulkan]\tEnabling instance layer VK_LAYER_KHRONOS_validation"
        ));
        assert!(text.contains(
            "[Warning]\tRequested instance layer VK_EXT_not_a_real_extension \
             is not supported"
        ));
    }
}
