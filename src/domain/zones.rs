//! Zone Registry
//!
//! Single source of truth for the zone-to-bit mapping and for the width of the
//! mask field on the wire.

use crate::domain::error::ZoneError;

/// Bitset selecting a subset of zones, bit `1 << id` per zone
pub type ZoneMask = u32;

/// Width of the zero-padded decimal mask field in `MASK:` commands
pub const MASK_FIELD_WIDTH: usize = 3;

/// One independently addressable segment of the fixture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: u32,
    pub name: String,
}

impl Zone {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Bit this zone occupies in a [`ZoneMask`]
    pub fn bit(&self) -> ZoneMask {
        1 << self.id
    }
}

/// Static table of the fixture's zones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRegistry {
    zones: Vec<Zone>,
    mask_width: usize,
}

impl ZoneRegistry {
    /// Build a registry from a zone table.
    ///
    /// Ids must be distinct and cover `0..zones.len()`, and the all-zones mask must
    /// fit in the mask field.
    pub fn new(zones: Vec<Zone>) -> Result<Self, ZoneError> {
        Self::with_mask_width(zones, MASK_FIELD_WIDTH)
    }

    pub fn with_mask_width(mut zones: Vec<Zone>, mask_width: usize) -> Result<Self, ZoneError> {
        let max = max_zones_for_width(mask_width);
        if zones.len() > max {
            return Err(ZoneError::TooManyZones {
                count: zones.len(),
                max,
            });
        }

        zones.sort_by_key(|z| z.id);
        for (expected, zone) in zones.iter().enumerate() {
            if zone.id as usize != expected {
                return Err(ZoneError::NonContiguous { id: zone.id });
            }
        }

        Ok(Self { zones, mask_width })
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone_by_id(&self, id: u32) -> Result<&Zone, ZoneError> {
        self.zones
            .get(id as usize)
            .ok_or(ZoneError::NotFound(id))
    }

    pub fn contains(&self, id: u32) -> bool {
        (id as usize) < self.zones.len()
    }

    /// `(1 << zone_count) - 1`
    pub fn all_zones_mask(&self) -> ZoneMask {
        match self.zones.len() {
            0 => 0,
            n => ZoneMask::MAX >> (ZoneMask::BITS as usize - n),
        }
    }

    /// Flip one zone in `mask`
    pub fn toggle_bit(&self, mask: ZoneMask, id: u32) -> Result<ZoneMask, ZoneError> {
        if !self.contains(id) {
            return Err(ZoneError::InvalidZone(id));
        }
        Ok(mask ^ (1 << id))
    }

    /// Select-all intent: all zones when any is missing, otherwise none
    pub fn toggle_all(&self, mask: ZoneMask) -> ZoneMask {
        if mask == self.all_zones_mask() {
            0
        } else {
            self.all_zones_mask()
        }
    }

    pub fn is_selected(&self, mask: ZoneMask, id: u32) -> bool {
        self.contains(id) && mask & (1 << id) != 0
    }

    /// True when `mask` has no bits outside the registry
    pub fn is_valid_mask(&self, mask: ZoneMask) -> bool {
        mask & !self.all_zones_mask() == 0
    }

    pub fn mask_from_ids(&self, ids: &[u32]) -> Result<ZoneMask, ZoneError> {
        ids.iter().try_fold(0, |mask, &id| {
            if !self.contains(id) {
                return Err(ZoneError::InvalidZone(id));
            }
            Ok(mask | (1 << id))
        })
    }

    pub fn mask_width(&self) -> usize {
        self.mask_width
    }

    /// Largest value the mask field can render
    pub fn mask_field_max(&self) -> ZoneMask {
        mask_field_max(self.mask_width)
    }
}

impl Default for ZoneRegistry {
    /// The nine zones of the mask fixture
    fn default() -> Self {
        let zones = [
            "temple top",
            "brows",
            "forehead",
            "left eye",
            "chin",
            "beak",
            "cheek",
            "right eye",
            "temple",
        ]
        .iter()
        .enumerate()
        .map(|(id, name)| Zone::new(id as u32, *name))
        .collect();

        Self {
            zones,
            mask_width: MASK_FIELD_WIDTH,
        }
    }
}

fn mask_field_max(width: usize) -> ZoneMask {
    10u32
        .checked_pow(width as u32)
        .map(|v| v - 1)
        .unwrap_or(ZoneMask::MAX)
}

/// Number of zones whose all-zones mask still renders in `width` decimal digits
fn max_zones_for_width(width: usize) -> usize {
    let limit = mask_field_max(width) as u64;
    (0..=ZoneMask::BITS as usize)
        .take_while(|&n| (1u64 << n) - 1 <= limit)
        .last()
        .unwrap_or(0)
}
