//! Built-in transformers, one per known server defect.

use crate::config::ConfigSnapshot;
use crate::inject::{Fallback, Fragment, MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY_MS, MethodRef, Notice};
use crate::ir::Constant;
use crate::patterns::call_site::UnsupportedCallSite;
use crate::patterns::negative_index::DroppedOutOfOrderData;
use crate::patterns::null_default::NullToEmptyDefault;
use crate::patterns::null_guard::{MissingNullGuard, NullableSource};
use crate::patterns::race_throw::ThrowOnRace;
use crate::patterns::tuning_constant::TuningConstant;
use crate::patterns::unguarded_body::UnguardedBody;
use crate::patterns::unset_field::{FieldAnchor, UnsetField};
use crate::patterns::unwanted_call::UnwantedCall;
use crate::pipeline::{Registry, Transformer};
use crate::rewriter::{MethodRewriter, TargetDescriptor};

pub const INTERACTION_CHAIN: &str = "interactionChain";
pub const WORLD: &str = "world";
pub const BLOCK_COMPONENT_CHUNK: &str = "blockComponentChunk";
pub const BEACON_SPAWN_CONTROLLER: &str = "beaconSpawnController";
pub const UUID_SYSTEM: &str = "uuidSystem";
pub const SPAWN_MARKER_ENTITY: &str = "spawnMarkerEntity";
pub const TICKING_THREAD: &str = "tickingThread";
pub const INTERACTION_TIMEOUT: &str = "interactionTimeout";
pub const UNIVERSE: &str = "universe";
pub const PLAYER_SYSTEMS: &str = "playerSystems";
pub const SPAWN_MARKER_SYSTEMS: &str = "spawnMarkerSystems";
pub const SPAWN_REFERENCE_SYSTEMS: &str = "spawnReferenceSystems";
pub const TRACKED_PLACEMENT: &str = "trackedPlacement";

/// Every transformer name the catalog registers, in registration order.
pub const TRANSFORMER_NAMES: [&str; 13] = [
    INTERACTION_CHAIN,
    WORLD,
    BLOCK_COMPONENT_CHUNK,
    BEACON_SPAWN_CONTROLLER,
    UUID_SYSTEM,
    SPAWN_MARKER_ENTITY,
    TICKING_THREAD,
    INTERACTION_TIMEOUT,
    UNIVERSE,
    PLAYER_SYSTEMS,
    SPAWN_MARKER_SYSTEMS,
    SPAWN_REFERENCE_SYSTEMS,
    TRACKED_PLACEMENT,
];

const DEFAULT_PRIORITY: i32 = 100;
/// Ordered after default-priority transformers of the same class.
const TRACKED_PLACEMENT_PRIORITY: i32 = 50;

const SPAWN_MARKER_ENTITY_CLASS: &str =
    "com.hypixel.hytale.server.spawning.spawnmarkers.SpawnMarkerEntity";
const NPC_REFERENCES: &str = "npcReferences";
const NPC_REFERENCES_DESCRIPTOR: &str =
    "[Lcom/hypixel/hytale/server/core/entity/reference/InvalidatablePersistentRef;";

/// Stock values of `PacketHandler.getOperationTimeoutThreshold`:
/// `avg_ping * 2.0 + 3000`.
const STOCK_PING_MULTIPLIER: f64 = 2.0;
const STOCK_BASE_TIMEOUT_MS: i64 = 3000;

pub fn registry(config: &ConfigSnapshot) -> Registry {
    let mut registry = Registry::new();
    for transformer in [
        interaction_chain(),
        world(config),
        block_component_chunk(),
        beacon_spawn_controller(),
        uuid_system(),
        spawn_marker_entity(),
        ticking_thread(),
        interaction_timeout(config),
        universe(),
        player_systems(),
        spawn_marker_systems(),
        spawn_reference_systems(),
        tracked_placement(),
    ] {
        let enabled = config.is_enabled(transformer.name());
        registry.register(transformer.with_enabled(enabled));
    }
    registry
}

fn interaction_chain() -> Transformer {
    Transformer::new(
        INTERACTION_CHAIN,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.core.entity.InteractionChain",
            "putInteractionSyncData",
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        "putInteractionSyncData",
        None,
        DroppedOutOfOrderData,
        Fragment::ClampAndResume {
            notice: Notice::out("Recovering out-of-order sync data!"),
        },
    ))
}

fn world(config: &ConfigSnapshot) -> Transformer {
    let exception = "java/lang/IllegalStateException";
    let message = "Player is already in a world";
    Transformer::new(
        WORLD,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.core.universe.world.World",
            "addPlayer",
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        "addPlayer",
        None,
        ThrowOnRace {
            exception: exception.to_string(),
            message_prefix: message.to_string(),
            require_probe: true,
        },
        Fragment::BoundedRetryLoop {
            attempts: config.retry_count.clamp(1, MAX_RETRY_ATTEMPTS),
            delay_ms: config.retry_delay_ms.min(MAX_RETRY_DELAY_MS),
        },
    ))
    .with_rewriter(MethodRewriter::new(
        "addPlayer",
        None,
        ThrowOnRace {
            exception: exception.to_string(),
            message_prefix: message.to_string(),
            require_probe: false,
        },
        Fragment::ThrowToContinue {
            notice: Notice::out(
                "WARNING: Player already in world during addPlayer - proceeding anyway (race condition handled)",
            ),
        },
    ))
}

fn block_component_chunk() -> Transformer {
    Transformer::new(
        BLOCK_COMPONENT_CHUNK,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.core.universe.world.chunk.BlockComponentChunk",
            "addEntityReference",
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        "addEntityReference",
        None,
        ThrowOnRace {
            exception: "java/lang/IllegalArgumentException".to_string(),
            message_prefix: "Duplicate block components".to_string(),
            require_probe: false,
        },
        Fragment::ThrowToReturn {
            notice: Notice::out(
                "WARNING: Duplicate block component in addEntityReference - keeping existing entry",
            ),
        },
    ))
}

fn beacon_spawn_controller() -> Transformer {
    Transformer::new(
        BEACON_SPAWN_CONTROLLER,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.spawning.controllers.BeaconSpawnController",
            "createRandomSpawnJob",
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        "createRandomSpawnJob",
        None,
        MissingNullGuard {
            source: NullableSource::Parameter(0),
        },
        Fragment::GuardAndReturn {
            notice: Notice::out(
                "WARNING: null spawn in createRandomSpawnJob - returning null (missing spawn config?)",
            ),
        },
    ))
}

fn uuid_system() -> Transformer {
    Transformer::new(
        UUID_SYSTEM,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.entity.EntityStore$UUIDSystem",
            "onEntityRemove",
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        "onEntityRemove",
        None,
        MissingNullGuard {
            source: NullableSource::CallResult {
                owner: Some("com/hypixel/hytale/component/Store".to_string()),
                name: "getComponent".to_string(),
            },
        },
        Fragment::GuardAndReturn {
            notice: Notice::out("WARNING: null UUIDComponent in onEntityRemove - skipping removal"),
        },
    ))
}

fn spawn_marker_entity() -> Transformer {
    let descriptor = format!("({NPC_REFERENCES_DESCRIPTOR})V");
    let unset = |anchor| UnsetField {
        field: NPC_REFERENCES.to_string(),
        descriptor: NPC_REFERENCES_DESCRIPTOR.to_string(),
        anchor,
    };
    Transformer::new(
        SPAWN_MARKER_ENTITY,
        TargetDescriptor::new(
            SPAWN_MARKER_ENTITY_CLASS,
            "setNpcReferences",
            Some(descriptor.as_str()),
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        "setNpcReferences",
        Some(descriptor.as_str()),
        NullToEmptyDefault {
            field: Some(NPC_REFERENCES.to_string()),
        },
        Fragment::DefaultSubstitution {
            notice: Notice::out("Creating missing npcReferences array in setNpcReferences"),
        },
    ))
    .with_rewriter(MethodRewriter::new(
        "<init>",
        Some("()V"),
        unset(FieldAnchor::ConstructorExit),
        Fragment::FieldDefault { notice: None },
    ))
    .with_rewriter(MethodRewriter::new(
        "spawnNPC",
        None,
        unset(FieldAnchor::AfterCall {
            method: "refreshTimeout".to_string(),
            guard_field: "storedFlock".to_string(),
        }),
        Fragment::FieldDefault {
            notice: Some(Notice::out(
                "Creating missing npcReferences array in spawnNPC (storedFlock was null)",
            )),
        },
    ))
}

fn ticking_thread() -> Transformer {
    Transformer::new(
        TICKING_THREAD,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.core.util.thread.TickingThread",
            "stop",
            Some("()V"),
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        "stop",
        Some("()V"),
        UnsupportedCallSite {
            owner: "java/lang/Thread".to_string(),
            name: "stop".to_string(),
            descriptor: "()V".to_string(),
            exception: "java/lang/UnsupportedOperationException".to_string(),
        },
        Fragment::ExceptionWrap {
            exception: "java/lang/UnsupportedOperationException".to_string(),
            fallback: Fallback::ReceiverCall(MethodRef::new("java/lang/Thread", "interrupt", "()V")),
            notice: Notice::err("Thread.stop() not supported on Java 21+, using interrupt() instead"),
        },
    ))
}

fn interaction_timeout(config: &ConfigSnapshot) -> Transformer {
    let method = "getOperationTimeoutThreshold";
    let multiplier = Constant::Double(config.ping_multiplier.to_bits());
    let base = Constant::Long(config.base_timeout_ms);
    Transformer::new(
        INTERACTION_TIMEOUT,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.core.io.PacketHandler",
            method,
            Some("()J"),
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        method,
        Some("()J"),
        TuningConstant {
            original: Constant::Double(STOCK_PING_MULTIPLIER.to_bits()),
            replacement: multiplier.clone(),
        },
        Fragment::ConstantSubstitution {
            replacement: multiplier,
        },
    ))
    .with_rewriter(MethodRewriter::new(
        method,
        Some("()J"),
        TuningConstant {
            original: Constant::Long(STOCK_BASE_TIMEOUT_MS),
            replacement: base.clone(),
        },
        Fragment::ConstantSubstitution {
            replacement: base,
        },
    ))
}

fn universe() -> Transformer {
    let player_ref = "Lcom/hypixel/hytale/server/core/universe/PlayerRef;";
    let chunk_tracker = "com/hypixel/hytale/server/core/modules/entity/player/ChunkTracker";
    let exception = "java/lang/IllegalStateException";
    Transformer::new(
        UNIVERSE,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.core.universe.Universe",
            "lambda$removePlayer$*",
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::prefixed(
        "lambda$removePlayer$",
        UnguardedBody {
            exception: exception.to_string(),
            parameter: player_ref.to_string(),
        },
        Fragment::ExceptionWrap {
            exception: exception.to_string(),
            fallback: Fallback::ParameterCleanup {
                parameter: player_ref.to_string(),
                calls: vec![
                    MethodRef::new(
                        "com/hypixel/hytale/server/core/universe/PlayerRef",
                        "getChunkTracker",
                        &format!("()L{chunk_tracker};"),
                    ),
                    MethodRef::new(chunk_tracker, "clear", "()V"),
                ],
                success: Notice::err("ChunkTracker cleared - memory leak prevented"),
                failure: Notice::err("Fallback cleanup failed - memory may leak"),
            },
            notice: Notice::err("Player ref invalid during removal - performing fallback cleanup"),
        },
    ))
}

fn player_systems() -> Transformer {
    let method = "onEntityRemoved";
    Transformer::new(
        PLAYER_SYSTEMS,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.core.modules.entity.player.PlayerSystems$PlayerRemovedSystem",
            method,
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        method,
        None,
        UnwantedCall {
            owner_suffix: "PlayerUtil".to_string(),
            name: "broadcastMessageToPlayers".to_string(),
            marker: "server.general.playerLeftWorld".to_string(),
        },
        Fragment::RemoveCall,
    ))
}

fn spawn_marker_systems() -> Transformer {
    let method = "onEntityRemove";
    Transformer::new(
        SPAWN_MARKER_SYSTEMS,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.npc.systems.SpawnReferenceSystems$MarkerAddRemoveSystem",
            method,
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        method,
        None,
        MissingNullGuard {
            source: NullableSource::CallResult {
                owner: None,
                name: "getNpcReferences".to_string(),
            },
        },
        Fragment::GuardAndReturn {
            notice: Notice::out(
                "WARNING: null npcReferences in MarkerAddRemoveSystem.onEntityRemove - skipping iteration",
            ),
        },
    ))
}

fn spawn_reference_systems() -> Transformer {
    let method = "onEntityAdded";
    Transformer::new(
        SPAWN_REFERENCE_SYSTEMS,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.npc.systems.SpawnReferenceSystems$BeaconAddRemoveSystem",
            method,
            None,
        ),
        DEFAULT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        method,
        None,
        MissingNullGuard {
            source: NullableSource::CallResult {
                owner: None,
                name: "getSpawnController".to_string(),
            },
        },
        Fragment::GuardAndReturn {
            notice: Notice::out(
                "WARNING: null spawnController in BeaconAddRemoveSystem.onEntityAdded - skipping beacon",
            ),
        },
    ))
}

fn tracked_placement() -> Transformer {
    let method = "onEntityRemove";
    Transformer::new(
        TRACKED_PLACEMENT,
        TargetDescriptor::new(
            "com.hypixel.hytale.server.core.modules.interaction.blocktrack.TrackedPlacement$OnAddRemove",
            method,
            None,
        ),
        TRACKED_PLACEMENT_PRIORITY,
    )
    .with_rewriter(MethodRewriter::new(
        method,
        None,
        MissingNullGuard {
            source: NullableSource::CallResult {
                owner: None,
                name: "getComponent".to_string(),
            },
        },
        Fragment::GuardAndReturn {
            notice: Notice::out(
                "WARNING: null TrackedPlacement component in onEntityRemove - skipping untrack",
            ),
        },
    ))
    .with_rewriter(MethodRewriter::new(
        method,
        None,
        MissingNullGuard {
            source: NullableSource::FieldValue {
                name: "blockName".to_string(),
            },
        },
        Fragment::GuardAndReturn {
            notice: Notice::out("WARNING: null blockName in onEntityRemove - skipping untrack"),
        },
    ))
}
