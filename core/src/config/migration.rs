use anyhow::Result;

/// Versioned on-disk configuration that knows how to upgrade itself.
pub trait Migrate {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	/// Upgrades `self` one or more versions until it reaches [`Migrate::target_version`].
	fn migrate(&mut self) -> Result<()>;

	fn needs_migration(&self) -> bool {
		self.current_version() < Self::target_version()
	}
}
