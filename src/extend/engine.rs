//! Capacity extension engine
//!
//! Talks to the array through the [`ArrayCommands`] port, gates every
//! extension on the topology and pool-capacity preconditions, and runs
//! the active-active rebuild pipeline. The pipeline does not
//! compensate: a mid-flight failure leaves the volume for an operator,
//! guarded by the barrier, with every remaining step named in the log.

use crate::error::{Error, Result};
use crate::extend::barrier::ExtensionBarrier;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

// =============================================================================
// Volume copies
// =============================================================================

/// Which end of a replication relationship a copy sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySide {
    Master,
    Aux,
}

impl fmt::Display for CopySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopySide::Master => write!(f, "master"),
            CopySide::Aux => write!(f, "aux"),
        }
    }
}

/// One physical copy of a volume as reported by the array.
#[derive(Debug, Clone)]
pub struct VolumeCopy {
    pub name: String,
    /// Also the replication relationship id for the master copy.
    pub id: String,
    pub size_gb: u64,
    pub pool: String,
    pub io_group: String,
    pub formatting: bool,
    pub local_copy_count: u32,
    /// Change volume absorbing writes during resync, active-active only.
    pub change_volume: Option<String>,
}

// =============================================================================
// Array port
// =============================================================================

/// Array-side commands the extension pipeline is built from.
#[async_trait]
pub trait ArrayCommands: Send + Sync {
    /// Master copy and, for active-active volumes, the aux copy.
    async fn volume_copies(&self, volume: &str) -> Result<(VolumeCopy, Option<VolumeCopy>)>;

    async fn pool_free_capacity_gb(&self, pool: &str) -> Result<u64>;

    async fn cluster_name(&self) -> Result<String>;

    async fn remove_replication(&self, relationship_id: &str) -> Result<()>;

    async fn expand_volume(&self, name: &str, delta_gb: u64) -> Result<()>;

    async fn create_active_active_replication(
        &self,
        master: &str,
        aux: &str,
        cluster: &str,
    ) -> Result<()>;

    async fn grant_io_group_access(&self, io_group: &str, volume: &str) -> Result<()>;

    async fn set_change_volume(
        &self,
        side: CopySide,
        change_volume: &str,
        relationship_id: &str,
    ) -> Result<()>;
}

pub type ArrayCommandsRef = Arc<dyn ArrayCommands>;

// =============================================================================
// Active-active pipeline steps
// =============================================================================

/// The strictly ordered rebuild pipeline. The relationship must be gone
/// before any copy can grow, and all four copies must be equal-sized
/// again before the relationship is recreated.
#[derive(Debug, Clone, Copy)]
enum AaStep {
    RemoveReplication,
    ExpandMaster,
    ExpandAux,
    ExpandMasterChangeVolume,
    ExpandAuxChangeVolume,
    RecreateReplication,
    GrantAuxIoGroupAccess,
    SetMasterChangeVolume,
    SetAuxChangeVolume,
}

const AA_STEPS: [AaStep; 9] = [
    AaStep::RemoveReplication,
    AaStep::ExpandMaster,
    AaStep::ExpandAux,
    AaStep::ExpandMasterChangeVolume,
    AaStep::ExpandAuxChangeVolume,
    AaStep::RecreateReplication,
    AaStep::GrantAuxIoGroupAccess,
    AaStep::SetMasterChangeVolume,
    AaStep::SetAuxChangeVolume,
];

struct AaContext<'a> {
    master: &'a VolumeCopy,
    aux: &'a VolumeCopy,
    master_cv: &'a str,
    aux_cv: &'a str,
    cluster: &'a str,
    delta_gb: u64,
}

impl AaStep {
    fn describe(&self, ctx: &AaContext<'_>) -> String {
        match self {
            AaStep::RemoveReplication => format!(
                "remove replication {} between {} -> {}",
                ctx.master.id, ctx.master.name, ctx.aux.name
            ),
            AaStep::ExpandMaster => format!("expand master {}", ctx.master.name),
            AaStep::ExpandAux => format!("expand aux {}", ctx.aux.name),
            AaStep::ExpandMasterChangeVolume => {
                format!("expand master change volume {}", ctx.master_cv)
            }
            AaStep::ExpandAuxChangeVolume => {
                format!("expand aux change volume {}", ctx.aux_cv)
            }
            AaStep::RecreateReplication => format!(
                "recreate replication in {} between {} -> {}",
                ctx.cluster, ctx.master.name, ctx.aux.name
            ),
            AaStep::GrantAuxIoGroupAccess => format!(
                "grant io group {} access to {}",
                ctx.aux.io_group, ctx.master.name
            ),
            AaStep::SetMasterChangeVolume => format!(
                "set master change volume {} on relationship {}",
                ctx.master_cv, ctx.master.id
            ),
            AaStep::SetAuxChangeVolume => format!(
                "set aux change volume {} on relationship {}",
                ctx.aux_cv, ctx.master.id
            ),
        }
    }
}

// =============================================================================
// Extension Engine
// =============================================================================

pub struct ExtensionEngine {
    barrier: ExtensionBarrier,
    array: ArrayCommandsRef,
}

impl ExtensionEngine {
    pub fn new(barrier: ExtensionBarrier, array: ArrayCommandsRef) -> Self {
        Self { barrier, array }
    }

    /// Grow `volume` to `new_size_gb`.
    ///
    /// Same size is a no-op, shrinking an error. An up barrier refuses
    /// the whole operation before anything touches the array.
    pub async fn extend(&self, volume: &str, new_size_gb: u64) -> Result<()> {
        if self.barrier.exists() {
            return Err(Error::BarrierPresent {
                path: self.barrier.path().to_path_buf(),
            });
        }

        let (master, aux) = self.array.volume_copies(volume).await?;

        let old_size_gb = master.size_gb;
        if new_size_gb == old_size_gb {
            return Ok(());
        }
        if new_size_gb < old_size_gb {
            return Err(Error::ShrinkNotSupported {
                volume: volume.to_string(),
                new_gb: new_size_gb,
                old_gb: old_size_gb,
            });
        }
        let delta_gb = new_size_gb - old_size_gb;

        self.can_extend(&master, aux.as_ref(), delta_gb).await?;

        let aux = match aux {
            None => {
                return self.array.expand_volume(&master.name, delta_gb).await;
            }
            Some(aux) => aux,
        };

        let cluster = self.array.cluster_name().await?;
        let master_cv = master.change_volume.clone().ok_or_else(|| {
            Error::Internal(format!("master copy {} has no change volume", master.name))
        })?;
        let aux_cv = aux.change_volume.clone().ok_or_else(|| {
            Error::Internal(format!("aux copy {} has no change volume", aux.name))
        })?;

        let ctx = AaContext {
            master: &master,
            aux: &aux,
            master_cv: &master_cv,
            aux_cv: &aux_cv,
            cluster: &cluster,
            delta_gb,
        };

        if let Err(e) = self.extend_active_active(&ctx).await {
            self.barrier.create(volume, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Preconditions checked before anything mutates.
    ///
    /// Active-active copies hold exactly two local copy mappings (to and
    /// from their change volume); anything else means a foreign
    /// relationship is attached and growing would corrupt it. The pool
    /// check doubles the delta because the change volume grows too.
    async fn can_extend(
        &self,
        master: &VolumeCopy,
        aux: Option<&VolumeCopy>,
        delta_gb: u64,
    ) -> Result<()> {
        if master.formatting {
            return Err(Error::VolumeFormatting {
                volume: master.name.clone(),
            });
        }

        let master_free = self.array.pool_free_capacity_gb(&master.pool).await?;

        let aux = match aux {
            None => {
                if master.local_copy_count != 0 {
                    return Err(Error::UnexpectedTopology {
                        volume: master.name.clone(),
                        local_copies: master.local_copy_count,
                        expected: 0,
                    });
                }
                if master_free < delta_gb {
                    return Err(Error::InsufficientPoolCapacity {
                        pool: master.pool.clone(),
                        available_gb: master_free,
                        required_gb: delta_gb,
                    });
                }
                return Ok(());
            }
            Some(aux) => aux,
        };

        if aux.formatting {
            return Err(Error::VolumeFormatting {
                volume: aux.name.clone(),
            });
        }

        for copy in [master, aux] {
            if copy.local_copy_count != 2 {
                return Err(Error::UnexpectedTopology {
                    volume: copy.name.clone(),
                    local_copies: copy.local_copy_count,
                    expected: 2,
                });
            }
        }

        let required = delta_gb * 2;
        let aux_free = self.array.pool_free_capacity_gb(&aux.pool).await?;
        for (pool, free) in [(&master.pool, master_free), (&aux.pool, aux_free)] {
            if free < required {
                return Err(Error::InsufficientPoolCapacity {
                    pool: pool.clone(),
                    available_gb: free,
                    required_gb: required,
                });
            }
        }

        Ok(())
    }

    async fn run_step(&self, step: AaStep, ctx: &AaContext<'_>) -> Result<()> {
        match step {
            AaStep::RemoveReplication => self.array.remove_replication(&ctx.master.id).await,
            AaStep::ExpandMaster => {
                self.array.expand_volume(&ctx.master.name, ctx.delta_gb).await
            }
            AaStep::ExpandAux => self.array.expand_volume(&ctx.aux.name, ctx.delta_gb).await,
            AaStep::ExpandMasterChangeVolume => {
                self.array.expand_volume(ctx.master_cv, ctx.delta_gb).await
            }
            AaStep::ExpandAuxChangeVolume => {
                self.array.expand_volume(ctx.aux_cv, ctx.delta_gb).await
            }
            AaStep::RecreateReplication => {
                self.array
                    .create_active_active_replication(
                        &ctx.master.name,
                        &ctx.aux.name,
                        ctx.cluster,
                    )
                    .await
            }
            AaStep::GrantAuxIoGroupAccess => {
                self.array
                    .grant_io_group_access(&ctx.aux.io_group, &ctx.master.name)
                    .await
            }
            AaStep::SetMasterChangeVolume => {
                self.array
                    .set_change_volume(CopySide::Master, ctx.master_cv, &ctx.master.id)
                    .await
            }
            AaStep::SetAuxChangeVolume => {
                self.array
                    .set_change_volume(CopySide::Aux, ctx.aux_cv, &ctx.master.id)
                    .await
            }
        }
    }

    async fn extend_active_active(&self, ctx: &AaContext<'_>) -> Result<()> {
        info!(
            "expanding active-active volume {} (aux {}, change volumes {} / {}, relationship {})",
            ctx.master.name, ctx.aux.name, ctx.master_cv, ctx.aux_cv, ctx.master.id
        );

        for (idx, step) in AA_STEPS.iter().enumerate() {
            debug!("step {}: {}", idx, step.describe(ctx));
            if let Err(e) = self.run_step(*step, ctx).await {
                error!("step {} ({}) failed: {}", idx, step.describe(ctx), e);
                for (i, rest) in AA_STEPS.iter().enumerate().skip(idx + 1) {
                    error!("step {} ({}) still needs to complete", i, rest.describe(ctx));
                }
                return Err(Error::ExtendStepFailed {
                    step: step.describe(ctx),
                    source: Box::new(e),
                });
            }
            info!("step {} ({}) done", idx, step.describe(ctx));
        }

        info!("active-active volume {} expanded", ctx.master.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeArray {
        master: VolumeCopy,
        aux: Option<VolumeCopy>,
        pool_free: HashMap<String, u64>,
        fail_on: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeArray {
        fn record(&self, call: String) -> Result<()> {
            self.calls.lock().unwrap().push(call.clone());
            if let Some(fail) = &self.fail_on {
                if call.starts_with(fail.as_str()) {
                    return Err(Error::CommandFailed {
                        program: "ssh".into(),
                        code: Some(1),
                        output: format!("injected failure on {}", call),
                    });
                }
            }
            Ok(())
        }

        fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ArrayCommands for FakeArray {
        async fn volume_copies(&self, _: &str) -> Result<(VolumeCopy, Option<VolumeCopy>)> {
            self.record("volume_copies".into())?;
            Ok((self.master.clone(), self.aux.clone()))
        }

        async fn pool_free_capacity_gb(&self, pool: &str) -> Result<u64> {
            self.record(format!("pool_free {}", pool))?;
            Ok(*self.pool_free.get(pool).unwrap_or(&0))
        }

        async fn cluster_name(&self) -> Result<String> {
            self.record("cluster_name".into())?;
            Ok("cluster0".into())
        }

        async fn remove_replication(&self, id: &str) -> Result<()> {
            self.record(format!("remove_replication {}", id))
        }

        async fn expand_volume(&self, name: &str, delta_gb: u64) -> Result<()> {
            self.record(format!("expand {} {}", name, delta_gb))
        }

        async fn create_active_active_replication(
            &self,
            master: &str,
            aux: &str,
            cluster: &str,
        ) -> Result<()> {
            self.record(format!("mk_replication {} {} {}", master, aux, cluster))
        }

        async fn grant_io_group_access(&self, io_group: &str, volume: &str) -> Result<()> {
            self.record(format!("grant_access {} {}", io_group, volume))
        }

        async fn set_change_volume(
            &self,
            side: CopySide,
            cv: &str,
            relationship_id: &str,
        ) -> Result<()> {
            self.record(format!("set_cv {} {} {}", side, cv, relationship_id))
        }
    }

    fn copy(name: &str, side: CopySide) -> VolumeCopy {
        VolumeCopy {
            name: name.into(),
            id: "17".into(),
            size_gb: 10,
            pool: format!("pool-{}", side),
            io_group: format!("iogrp-{}", side),
            formatting: false,
            local_copy_count: 2,
            change_volume: Some(format!("{}-cv", name)),
        }
    }

    fn basic_copy(name: &str) -> VolumeCopy {
        VolumeCopy {
            local_copy_count: 0,
            change_volume: None,
            ..copy(name, CopySide::Master)
        }
    }

    fn make_engine(array: FakeArray) -> (ExtensionEngine, Arc<FakeArray>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let barrier = ExtensionBarrier::new(tmp.path().join("barrier"));
        let array = Arc::new(array);
        (
            ExtensionEngine::new(barrier, array.clone()),
            array,
            tmp,
        )
    }

    fn aa_array(free_master: u64, free_aux: u64) -> FakeArray {
        FakeArray {
            master: copy("vol-a", CopySide::Master),
            aux: Some(copy("vol-a-aux", CopySide::Aux)),
            pool_free: HashMap::from([
                ("pool-master".to_string(), free_master),
                ("pool-aux".to_string(), free_aux),
            ]),
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_barrier_short_circuits_everything() {
        let (engine, array, tmp) = make_engine(aa_array(100, 100));
        std::fs::write(tmp.path().join("barrier"), "!!!!!! ATTENTION !!!!!!").unwrap();

        let err = engine.extend("vol-a", 20).await.unwrap_err();

        assert_matches!(err, Error::BarrierPresent { .. });
        assert!(array.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_same_size_is_a_noop() {
        let (engine, array, _tmp) = make_engine(aa_array(100, 100));
        engine.extend("vol-a", 10).await.unwrap();
        assert_eq!(array.recorded(), vec!["volume_copies".to_string()]);
    }

    #[tokio::test]
    async fn test_shrink_is_refused() {
        let (engine, _, _tmp) = make_engine(aa_array(100, 100));
        let err = engine.extend("vol-a", 5).await.unwrap_err();
        assert_matches!(err, Error::ShrinkNotSupported { new_gb: 5, old_gb: 10, .. });
    }

    #[tokio::test]
    async fn test_basic_volume_single_expand() {
        let (engine, array, _tmp) = make_engine(FakeArray {
            master: basic_copy("vol-b"),
            aux: None,
            pool_free: HashMap::from([("pool-master".to_string(), 100)]),
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        });

        engine.extend("vol-b", 16).await.unwrap();

        let calls = array.recorded();
        assert_eq!(calls.last().unwrap(), "expand vol-b 6");
        assert_eq!(array.recorded().iter().filter(|c| c.starts_with("expand")).count(), 1);
    }

    #[tokio::test]
    async fn test_basic_volume_with_local_copies_is_refused() {
        let (engine, _, _tmp) = make_engine(FakeArray {
            master: VolumeCopy {
                local_copy_count: 1,
                ..basic_copy("vol-b")
            },
            aux: None,
            pool_free: HashMap::from([("pool-master".to_string(), 100)]),
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        });

        let err = engine.extend("vol-b", 16).await.unwrap_err();
        assert_matches!(err, Error::UnexpectedTopology { local_copies: 1, expected: 0, .. });
    }

    #[tokio::test]
    async fn test_formatting_volume_is_refused() {
        let (engine, _, _tmp) = make_engine(FakeArray {
            master: VolumeCopy {
                formatting: true,
                ..copy("vol-a", CopySide::Master)
            },
            aux: Some(copy("vol-a-aux", CopySide::Aux)),
            pool_free: HashMap::new(),
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        });

        let err = engine.extend("vol-a", 20).await.unwrap_err();
        assert_matches!(err, Error::VolumeFormatting { .. });
    }

    #[tokio::test]
    async fn test_active_active_needs_twice_the_delta_free() {
        // delta is 10, so 19 free is not enough
        let (engine, _, _tmp) = make_engine(aa_array(100, 19));
        let err = engine.extend("vol-a", 20).await.unwrap_err();
        assert_matches!(
            err,
            Error::InsufficientPoolCapacity { available_gb: 19, required_gb: 20, .. }
        );

        // exactly 2x delta passes the gate
        let (engine, _, _tmp) = make_engine(aa_array(20, 20));
        engine.extend("vol-a", 20).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_active_pipeline_order() {
        let (engine, array, _tmp) = make_engine(aa_array(100, 100));

        engine.extend("vol-a", 20).await.unwrap();

        let steps: Vec<String> = array
            .recorded()
            .into_iter()
            .filter(|c| !c.starts_with("volume_copies"))
            .filter(|c| !c.starts_with("pool_free"))
            .filter(|c| !c.starts_with("cluster_name"))
            .collect();
        assert_eq!(
            steps,
            vec![
                "remove_replication 17",
                "expand vol-a 10",
                "expand vol-a-aux 10",
                "expand vol-a-cv 10",
                "expand vol-a-aux-cv 10",
                "mk_replication vol-a vol-a-aux cluster0",
                "grant_access iogrp-aux vol-a",
                "set_cv master vol-a-cv 17",
                "set_cv aux vol-a-aux-cv 17",
            ]
        );
    }

    #[tokio::test]
    async fn test_pipeline_failure_raises_barrier_and_stops() {
        let (engine, array, tmp) = make_engine(FakeArray {
            fail_on: Some("mk_replication".into()),
            ..aa_array(100, 100)
        });

        let err = engine.extend("vol-a", 20).await.unwrap_err();

        assert_matches!(err, Error::ExtendStepFailed { ref step, .. } if step.contains("recreate replication"));
        // nothing after the failed step ran
        assert!(!array.recorded().iter().any(|c| c.starts_with("grant_access")));
        assert!(!array.recorded().iter().any(|c| c.starts_with("set_cv")));

        // barrier is up and blocks the retry
        let content = std::fs::read_to_string(tmp.path().join("barrier")).unwrap();
        assert!(content.contains("!!!!!! ATTENTION !!!!!!"));
        assert!(content.contains("vol-a"));
        let err = engine.extend("vol-a", 20).await.unwrap_err();
        assert_matches!(err, Error::BarrierPresent { .. });
    }
}
