//! Queue family capability resolution.

use crate::error::{GpuError, Result};
use ash::vk;
use std::fmt;

/// Something a queue family must be able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Graphics commands
    Graphics,
    /// Compute dispatches
    Compute,
    /// Transfer commands
    Transfer,
    /// Presentation to the given surface
    Present(vk::SurfaceKHR),
}

impl Capability {
    /// Native queue flag for flag-based capabilities, `None` for presentation.
    pub const fn queue_flag(self) -> Option<vk::QueueFlags> {
        match self {
            Self::Graphics => Some(vk::QueueFlags::GRAPHICS),
            Self::Compute => Some(vk::QueueFlags::COMPUTE),
            Self::Transfer => Some(vk::QueueFlags::TRANSFER),
            Self::Present(_) => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graphics => f.write_str("graphics"),
            Self::Compute => f.write_str("compute"),
            Self::Transfer => f.write_str("transfer"),
            Self::Present(surface) => write!(f, "present({surface:?})"),
        }
    }
}

/// A device queue and the family it was created from.
///
/// Command buffers may only be submitted to queues of their pool's family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queue {
    /// Raw handle
    pub handle: vk::Queue,
    /// Queue family index
    pub family: u32,
}

impl Queue {
    /// Fail unless a command buffer from `family` may be submitted here.
    pub fn check_family(&self, family: u32) -> Result<()> {
        if family == self.family {
            return Ok(());
        }
        Err(GpuError::InvalidState(format!(
            "command buffer of queue family {family} submitted to a queue of family {}",
            self.family
        )))
    }
}

/// Ordered mapping from each requested capability to the family serving it.
///
/// Only complete maps leave [`resolve_queue_families`]; every capability in a
/// map returned from it has a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFamilyMap {
    entries: Vec<(Capability, Option<u32>)>,
    resolved: usize,
}

impl QueueFamilyMap {
    fn new(requirements: &[Capability]) -> Self {
        let mut entries: Vec<(Capability, Option<u32>)> = Vec::with_capacity(requirements.len());
        for &capability in requirements {
            if !entries.iter().any(|(existing, _)| *existing == capability) {
                entries.push((capability, None));
            }
        }
        Self {
            entries,
            resolved: 0,
        }
    }

    fn bind(&mut self, index: usize, family: u32) {
        let slot = &mut self.entries[index].1;
        if slot.is_none() {
            *slot = Some(family);
            self.resolved += 1;
        }
    }

    /// Returns true when every capability has a family.
    pub fn is_complete(&self) -> bool {
        self.resolved == self.entries.len()
    }

    /// Number of distinct capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no capabilities were requested.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Family serving `capability`.
    pub fn family(&self, capability: Capability) -> Option<u32> {
        self.entries
            .iter()
            .find(|(c, _)| *c == capability)
            .and_then(|(_, family)| *family)
    }

    /// Family of the first requested capability.
    pub fn primary_family(&self) -> Option<u32> {
        self.entries.first().and_then(|(_, family)| *family)
    }

    /// Distinct families in first-use order.
    pub fn distinct_families(&self) -> Vec<u32> {
        let mut families = Vec::new();
        for family in self.entries.iter().filter_map(|(_, family)| *family) {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }

    /// Iterate `(capability, family)` pairs in request order.
    pub fn iter(&self) -> impl Iterator<Item = (Capability, Option<u32>)> + '_ {
        self.entries.iter().copied()
    }

    fn unresolved(&self) -> Vec<Capability> {
        self.entries
            .iter()
            .filter(|(_, family)| family.is_none())
            .map(|(capability, _)| *capability)
            .collect()
    }
}

/// Bind every requirement to the first queue family that satisfies it.
///
/// Families with no queues are skipped. A family may serve several
/// capabilities; dedicated families are not preferred. `surface_support` is
/// consulted for [`Capability::Present`] and called at most once per family
/// and surface; an error from it counts as "not supported".
///
/// An empty requirement list resolves trivially. Anything short of a complete
/// map is returned as [`GpuError::UnresolvedQueues`].
pub fn resolve_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    requirements: &[Capability],
    mut surface_support: F,
) -> Result<QueueFamilyMap>
where
    F: FnMut(u32, vk::SurfaceKHR) -> Result<bool>,
{
    let mut map = QueueFamilyMap::new(requirements);
    if map.is_complete() {
        return Ok(map);
    }

    for (index, family) in families.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let family_index = index as u32;

        for slot in 0..map.entries.len() {
            let (capability, bound) = map.entries[slot];
            if bound.is_some() {
                continue;
            }
            let supported = match capability.queue_flag() {
                Some(flag) => family.queue_flags.contains(flag),
                None => {
                    let Capability::Present(surface) = capability else {
                        continue;
                    };
                    surface_support(family_index, surface).unwrap_or_else(|e| {
                        tracing::warn!(
                            "Surface support query failed for family {}: {}",
                            family_index,
                            e
                        );
                        false
                    })
                }
            };
            if supported {
                map.bind(slot, family_index);
            }
        }

        if map.is_complete() {
            return Ok(map);
        }
    }

    Err(GpuError::UnresolvedQueues(map.unresolved()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    fn no_surface(_: u32, _: vk::SurfaceKHR) -> Result<bool> {
        Ok(false)
    }

    #[test]
    fn single_family_serves_everything() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            1,
        )];
        let map = resolve_queue_families(
            &families,
            &[Capability::Compute, Capability::Graphics],
            no_surface,
        )
        .unwrap();
        assert!(map.is_complete());
        assert_eq!(map.family(Capability::Compute), Some(0));
        assert_eq!(map.family(Capability::Graphics), Some(0));
        assert_eq!(map.distinct_families(), vec![0]);
    }

    #[test]
    fn first_fit_does_not_prefer_dedicated_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::COMPUTE, 4),
        ];
        let map = resolve_queue_families(&families, &[Capability::Compute], no_surface).unwrap();
        assert_eq!(map.family(Capability::Compute), Some(0));
    }

    #[test]
    fn split_families() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        let map = resolve_queue_families(
            &families,
            &[Capability::Compute, Capability::Transfer],
            no_surface,
        )
        .unwrap();
        assert_eq!(map.primary_family(), Some(1));
        assert_eq!(map.family(Capability::Transfer), Some(0));
        assert_eq!(map.distinct_families(), vec![1, 0]);
    }

    #[test]
    fn empty_requirements_resolve_trivially() {
        let map = resolve_queue_families(&[], &[], no_surface).unwrap();
        assert!(map.is_empty());
        assert!(map.is_complete());
    }

    #[test]
    fn zero_families_fail() {
        let err = resolve_queue_families(&[], &[Capability::Graphics], no_surface).unwrap_err();
        assert!(matches!(err, GpuError::UnresolvedQueues(ref caps) if caps == &[Capability::Graphics]));
    }

    #[test]
    fn partial_resolution_is_an_error() {
        let families = [family(vk::QueueFlags::COMPUTE, 1)];
        let err = resolve_queue_families(
            &families,
            &[Capability::Compute, Capability::Graphics],
            no_surface,
        )
        .unwrap_err();
        match err {
            GpuError::UnresolvedQueues(missing) => assert_eq!(missing, vec![Capability::Graphics]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_count_families_are_skipped() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 0),
            family(vk::QueueFlags::GRAPHICS, 2),
        ];
        let map = resolve_queue_families(&families, &[Capability::Graphics], no_surface).unwrap();
        assert_eq!(map.family(Capability::Graphics), Some(1));
    }

    #[test]
    fn present_queries_each_family_once() {
        let surface = vk::SurfaceKHR::from_raw(7);
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::TRANSFER, 1),
        ];
        let mut queried = Vec::new();
        let map = resolve_queue_families(
            &families,
            &[
                Capability::Graphics,
                Capability::Present(surface),
                Capability::Present(surface),
            ],
            |family, s| {
                queried.push((family, s));
                Ok(family == 1)
            },
        )
        .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.family(Capability::Present(surface)), Some(1));
        assert_eq!(queried, vec![(0, surface), (1, surface)]);
    }

    #[test]
    fn surface_query_error_counts_as_unsupported() {
        let surface = vk::SurfaceKHR::from_raw(3);
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        let err = resolve_queue_families(&families, &[Capability::Present(surface)], |_, _| {
            Err(GpuError::ApiCall {
                call: "vkGetPhysicalDeviceSurfaceSupportKHR",
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
            })
        })
        .unwrap_err();
        assert!(matches!(err, GpuError::UnresolvedQueues(_)));
    }

    #[test]
    fn stops_at_first_complete_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 1),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        let surface = vk::SurfaceKHR::from_raw(1);
        let mut calls = 0;
        let map = resolve_queue_families(
            &families,
            &[Capability::Graphics, Capability::Present(surface)],
            |_, _| {
                calls += 1;
                Ok(true)
            },
        )
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(map.distinct_families(), vec![0]);
    }

    #[test]
    fn queue_accepts_only_its_own_family() {
        let queue = Queue {
            handle: vk::Queue::from_raw(0x42),
            family: 1,
        };
        assert!(queue.check_family(1).is_ok());
        let err = queue.check_family(0).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(err.to_string().contains("family 0"));
    }
}
