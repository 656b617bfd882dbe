//! Launch plan construction.
//!
//! Everything here is pure: building a plan never touches the filesystem or
//! the runtime. Directory creation and plan persistence live in
//! [`SeedDirectories::create`] and [`persist_plan`].

mod builder;
mod layout;

pub use builder::{PlanBuilder, PlanBuilderConfig, seed_hash, unit_base_name};
pub use layout::{PLAN_FILE, SeedDirectories, persist_plan};

/// Container-side mount point for the seed directory.
pub const CONFIG_MOUNT: &str = "/config";
/// Container-side mount point for exported world data.
pub const WORLD_DATA_MOUNT: &str = "/opt/valheim/world_data";
/// Container-side mount point for workload plugins.
pub const PLUGINS_MOUNT: &str = "/config/bepinex/plugins";

pub const LABEL_TYPE: &str = "worldgen.type";
pub const LABEL_SEED_HASH: &str = "worldgen.seed_hash";
pub const LABEL_ENGINE_ID: &str = "worldgen.engine_id";
pub const LABEL_CREATED: &str = "worldgen.created";
pub const TYPE_COLD: &str = "worldgen";
pub const TYPE_WARM_ENGINE: &str = "warm-engine";
