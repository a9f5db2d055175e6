/// Staleness of the quantities the functional derives from the current displacements.
///
/// Every flag is raised together by [`CacheValidity::invalidate`]; each derived quantity
/// clears its own flag once it has been recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheValidity {
    displacements_pending: bool,
    regions_stale: bool,
    energy_stale: bool,
}

impl Default for CacheValidity {
    fn default() -> Self {
        Self::stale()
    }
}

impl CacheValidity {
    pub fn stale() -> Self {
        Self {
            displacements_pending: true,
            regions_stale: true,
            energy_stale: true,
        }
    }

    #[inline]
    pub fn invalidate(&mut self) {
        *self = Self::stale();
    }

    #[inline]
    pub fn displacements_pending(&self) -> bool {
        self.displacements_pending
    }

    #[inline]
    pub fn regions_stale(&self) -> bool {
        self.regions_stale
    }

    #[inline]
    pub fn energy_stale(&self) -> bool {
        self.energy_stale
    }

    #[inline]
    pub fn mark_displacements_applied(&mut self) {
        self.displacements_pending = false;
    }

    #[inline]
    pub fn mark_regions_built(&mut self) {
        self.regions_stale = false;
    }

    #[inline]
    pub fn mark_energy_computed(&mut self) {
        self.energy_stale = false;
    }

    pub fn is_fresh(&self) -> bool {
        !(self.displacements_pending || self.regions_stale || self.energy_stale)
    }
}
