//! Stand-ins for the server classes the catalog patches, compiled the way
//! javac lays out the defective methods.

use super::*;

pub const WORLD: &str = "com.hypixel.hytale.server.core.universe.world.World";
pub const PLAYER_REF: &str = "com/hypixel/hytale/server/core/universe/PlayerRef";
pub const INTERACTION_CHAIN: &str = "com.hypixel.hytale.server.core.entity.InteractionChain";
pub const BLOCK_COMPONENT_CHUNK: &str =
    "com.hypixel.hytale.server.core.universe.world.chunk.BlockComponentChunk";
pub const BEACON_SPAWN_CONTROLLER: &str =
    "com.hypixel.hytale.server.spawning.controllers.BeaconSpawnController";
pub const UUID_SYSTEM: &str = "com.hypixel.hytale.server.entity.EntityStore$UUIDSystem";
pub const SPAWN_MARKER_ENTITY: &str =
    "com.hypixel.hytale.server.spawning.spawnmarkers.SpawnMarkerEntity";
pub const TICKING_THREAD: &str = "com.hypixel.hytale.server.core.util.thread.TickingThread";
pub const PACKET_HANDLER: &str = "com.hypixel.hytale.server.core.io.PacketHandler";
pub const UNIVERSE: &str = "com.hypixel.hytale.server.core.universe.Universe";
pub const PLAYER_REMOVED_SYSTEM: &str =
    "com.hypixel.hytale.server.core.modules.entity.player.PlayerSystems$PlayerRemovedSystem";
pub const MARKER_ADD_REMOVE_SYSTEM: &str =
    "com.hypixel.hytale.server.npc.systems.SpawnReferenceSystems$MarkerAddRemoveSystem";
pub const BEACON_ADD_REMOVE_SYSTEM: &str =
    "com.hypixel.hytale.server.npc.systems.SpawnReferenceSystems$BeaconAddRemoveSystem";
pub const TRACKED_PLACEMENT_ON_ADD_REMOVE: &str =
    "com.hypixel.hytale.server.core.modules.interaction.blocktrack.TrackedPlacement$OnAddRemove";

fn internal(name: &str) -> String {
    name.replace('.', "/")
}

/// `if (player.getWorld() != null) throw new IllegalStateException(...); return;`
pub fn world_class() -> Vec<u8> {
    let mut class = ClassBuilder::new(&internal(WORLD));
    let world_descriptor = format!("L{};", internal(WORLD));
    let get_world = class.method_ref(PLAYER_REF, "getWorld", &format!("(){world_descriptor}"));
    let exception = class.class("java/lang/IllegalStateException");
    let message = class.string("Player is already in a world");
    let init = class.method_ref(
        "java/lang/IllegalStateException",
        "<init>",
        "(Ljava/lang/String;)V",
    );
    let code = [
        vec![ALOAD_1],
        op_u16(INVOKEVIRTUAL, get_world),
        branch(IFNULL, 13),
        op_u16(NEW, exception),
        vec![DUP],
        ldc(message),
        op_u16(INVOKESPECIAL, init),
        vec![ATHROW],
        vec![RETURN],
    ]
    .concat();
    // same_frame at offset 17.
    class.method(
        "addPlayer",
        &format!("(L{PLAYER_REF};)V"),
        3,
        2,
        code,
        Some((1, vec![17])),
    );
    class.build()
}

/// `int index = position - offset; if (index < 0) return; syncData.add(index, data);`
pub fn interaction_chain_class() -> Vec<u8> {
    let owner = internal(INTERACTION_CHAIN);
    let mut class = ClassBuilder::new(&owner);
    let offset = class.field(&owner, "offset", "I");
    let sync_data = class.field(&owner, "syncData", "Ljava/util/List;");
    let add = class.interface_method_ref("java/util/List", "add", "(ILjava/lang/Object;)V");
    let code = [
        vec![ILOAD_1, ALOAD_0],
        op_u16(GETFIELD, offset),
        vec![ISUB, ISTORE_3, ILOAD_3],
        branch(IFGE, 4),
        vec![RETURN, ALOAD_0],
        op_u16(GETFIELD, sync_data),
        vec![ILOAD_3, ALOAD_2],
        invokeinterface(add, 3),
        vec![RETURN],
    ]
    .concat();
    // append_frame at offset 12 adding one int local.
    class.method(
        "putInteractionSyncData",
        "(ILjava/lang/Object;)V",
        3,
        4,
        code,
        Some((1, vec![252, 0, 12, 1])),
    );
    class.build()
}

/// `if (entries.containsKey(index)) throw new IllegalArgumentException(...); return;`
pub fn block_component_chunk_class() -> Vec<u8> {
    let owner = internal(BLOCK_COMPONENT_CHUNK);
    let mut class = ClassBuilder::new(&owner);
    let entries = class.field(&owner, "entries", "Ljava/util/Map;");
    let value_of = class.method_ref("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;");
    let contains_key =
        class.interface_method_ref("java/util/Map", "containsKey", "(Ljava/lang/Object;)Z");
    let exception = class.class("java/lang/IllegalArgumentException");
    let message = class.string("Duplicate block components at: ");
    let init = class.method_ref(
        "java/lang/IllegalArgumentException",
        "<init>",
        "(Ljava/lang/String;)V",
    );
    let code = [
        vec![ALOAD_0],
        op_u16(GETFIELD, entries),
        vec![ILOAD_1],
        op_u16(INVOKESTATIC, value_of),
        invokeinterface(contains_key, 2),
        branch(IFEQ, 13),
        op_u16(NEW, exception),
        vec![DUP],
        ldc(message),
        op_u16(INVOKESPECIAL, init),
        vec![ATHROW],
        vec![RETURN],
    ]
    .concat();
    // same_frame at offset 26.
    class.method("addEntityReference", "(I)V", 3, 2, code, Some((1, vec![26])));
    class.build()
}

/// `return spawn.getType();`
pub fn beacon_spawn_controller_class() -> Vec<u8> {
    let mut class = ClassBuilder::new(&internal(BEACON_SPAWN_CONTROLLER));
    let spawn = "com/hypixel/hytale/server/spawning/Spawn";
    let get_type = class.method_ref(spawn, "getType", "()Ljava/lang/String;");
    let code = [vec![ALOAD_1], op_u16(INVOKEVIRTUAL, get_type), vec![ARETURN]].concat();
    class.method(
        "createRandomSpawnJob",
        &format!("(L{spawn};)Ljava/lang/String;"),
        1,
        2,
        code,
        None,
    );
    class.build()
}

/// `UUIDComponent uuid = (UUIDComponent) store.getComponent(ref, TYPE); uuid.getUuid();`
pub fn uuid_system_class() -> Vec<u8> {
    let mut class = ClassBuilder::new(&internal(UUID_SYSTEM));
    let reference = "com/hypixel/hytale/component/Ref";
    let store = "com/hypixel/hytale/component/Store";
    let component_type = "com/hypixel/hytale/component/ComponentType";
    let uuid_component = "com/hypixel/hytale/server/core/entity/UUIDComponent";
    let type_field = class.field(uuid_component, "TYPE", &format!("L{component_type};"));
    let get_component = class.method_ref(
        store,
        "getComponent",
        &format!("(L{reference};L{component_type};)Lcom/hypixel/hytale/component/Component;"),
    );
    let cast = class.class(uuid_component);
    let get_uuid = class.method_ref(uuid_component, "getUuid", "()Ljava/util/UUID;");
    let code = [
        vec![ALOAD_2, ALOAD_1],
        op_u16(GETSTATIC, type_field),
        op_u16(INVOKEVIRTUAL, get_component),
        op_u16(CHECKCAST, cast),
        vec![ASTORE_3, ALOAD_3],
        op_u16(INVOKEVIRTUAL, get_uuid),
        vec![POP, RETURN],
    ]
    .concat();
    class.method(
        "onEntityRemove",
        &format!("(L{reference};L{store};)V"),
        3,
        4,
        code,
        None,
    );
    class.build()
}

pub const NPC_REFERENCES_DESCRIPTOR: &str =
    "[Lcom/hypixel/hytale/server/core/entity/reference/InvalidatablePersistentRef;";

/// `setNpcReferences(refs)`, the no-argument constructor and `spawnNPC()`,
/// which only assigns `npcReferences` when `storedFlock` is set.
pub fn spawn_marker_entity_class() -> Vec<u8> {
    let owner = internal(SPAWN_MARKER_ENTITY);
    let mut class = ClassBuilder::new(&owner);
    let field = class.field(&owner, "npcReferences", NPC_REFERENCES_DESCRIPTOR);
    let code = [vec![ALOAD_0, ALOAD_1], op_u16(PUTFIELD, field), vec![RETURN]].concat();
    class.method(
        "setNpcReferences",
        &format!("({NPC_REFERENCES_DESCRIPTOR})V"),
        2,
        2,
        code,
        None,
    );

    let object_init = class.method_ref("java/lang/Object", "<init>", "()V");
    let code = [vec![ALOAD_0], op_u16(INVOKESPECIAL, object_init), vec![RETURN]].concat();
    class.method("<init>", "()V", 1, 1, code, None);

    let stored_flock = class.field(
        &owner,
        "storedFlock",
        "Lcom/hypixel/hytale/server/flock/StoredFlock;",
    );
    let create = class.method_ref(
        &owner,
        "createNpcReferences",
        &format!("(){NPC_REFERENCES_DESCRIPTOR}"),
    );
    let refresh = class.method_ref(&owner, "refreshTimeout", "()V");
    let code = [
        vec![ALOAD_0],
        op_u16(GETFIELD, stored_flock),
        branch(IFNULL, 11),
        vec![ALOAD_0, ALOAD_0],
        op_u16(INVOKEVIRTUAL, create),
        op_u16(PUTFIELD, field),
        vec![ALOAD_0],
        op_u16(INVOKEVIRTUAL, refresh),
        vec![ICONST_1, IRETURN],
    ]
    .concat();
    // same_frame at offset 15.
    class.method("spawnNPC", "()Z", 2, 1, code, Some((1, vec![15])));
    class.build()
}

/// `this.thread.stop();`
pub fn ticking_thread_class() -> Vec<u8> {
    let owner = internal(TICKING_THREAD);
    let mut class = ClassBuilder::new(&owner);
    let thread = class.field(&owner, "thread", "Ljava/lang/Thread;");
    let stop = class.method_ref("java/lang/Thread", "stop", "()V");
    let code = [
        vec![ALOAD_0],
        op_u16(GETFIELD, thread),
        op_u16(INVOKEVIRTUAL, stop),
        vec![RETURN],
    ]
    .concat();
    class.method("stop", "()V", 1, 1, code, None);
    class.build()
}

/// `return (long) (getAveragePing() * 2.0) + 3000L;`
pub fn packet_handler_class() -> Vec<u8> {
    let owner = internal(PACKET_HANDLER);
    let mut class = ClassBuilder::new(&owner);
    let ping = class.method_ref(&owner, "getAveragePing", "()D");
    let multiplier = class.double(2.0);
    let base = class.long(3000);
    let code = [
        vec![ALOAD_0],
        op_u16(INVOKEVIRTUAL, ping),
        op_u16(LDC2_W, multiplier),
        vec![DMUL, D2L],
        op_u16(LDC2_W, base),
        vec![LADD, LRETURN],
    ]
    .concat();
    class.method("getOperationTimeoutThreshold", "()J", 4, 1, code, None);
    class.build()
}

pub const CHUNK_TRACKER: &str = "com/hypixel/hytale/server/core/modules/entity/player/ChunkTracker";

/// `private static synthetic void lambda$removePlayer$3(PlayerRef ref) { ref.removeFromStore(); }`
pub fn universe_class() -> Vec<u8> {
    let mut class = ClassBuilder::new(&internal(UNIVERSE));
    let remove = class.method_ref(PLAYER_REF, "removeFromStore", "()V");
    let code = [vec![ALOAD_0], op_u16(INVOKEVIRTUAL, remove), vec![RETURN]].concat();
    class.method_with_access(
        ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC,
        "lambda$removePlayer$3",
        &format!("(L{PLAYER_REF};)V"),
        1,
        1,
        code,
        None,
    );
    class.build()
}

pub const BROADCAST_DESCRIPTOR: &str =
    "(Ljava/util/UUID;Lcom/hypixel/hytale/server/core/Message;)V";

/// `cleanup(); PlayerUtil.broadcastMessageToPlayers(uuid, Message.translation("server.general.playerLeftWorld"));`
///
/// Returns the class and the constant pool index of the broadcast methodref.
pub fn player_removed_system_class() -> (Vec<u8>, u16) {
    let owner = internal(PLAYER_REMOVED_SYSTEM);
    let mut class = ClassBuilder::new(&owner);
    let message = "com/hypixel/hytale/server/core/Message";
    let cleanup = class.method_ref(&owner, "cleanup", "()V");
    let key = class.string("server.general.playerLeftWorld");
    let translation = class.method_ref(
        message,
        "translation",
        &format!("(Ljava/lang/String;)L{message};"),
    );
    let broadcast = class.method_ref(
        "com/hypixel/hytale/server/core/util/PlayerUtil",
        "broadcastMessageToPlayers",
        BROADCAST_DESCRIPTOR,
    );
    let code = [
        vec![ALOAD_0],
        op_u16(INVOKEVIRTUAL, cleanup),
        vec![ALOAD_1],
        ldc(key),
        op_u16(INVOKESTATIC, translation),
        op_u16(INVOKESTATIC, broadcast),
        vec![RETURN],
    ]
    .concat();
    class.method("onEntityRemoved", "(Ljava/util/UUID;)V", 2, 2, code, None);
    (class.build(), broadcast)
}

/// `InvalidatablePersistentRef[] refs = marker.getNpcReferences(); refs.length;`
pub fn marker_add_remove_system_class() -> Vec<u8> {
    let mut class = ClassBuilder::new(&internal(MARKER_ADD_REMOVE_SYSTEM));
    let marker = internal(SPAWN_MARKER_ENTITY);
    let get_references = class.method_ref(
        &marker,
        "getNpcReferences",
        &format!("(){NPC_REFERENCES_DESCRIPTOR}"),
    );
    let code = [
        vec![ALOAD_1],
        op_u16(INVOKEVIRTUAL, get_references),
        vec![ASTORE_2, ALOAD_2, ARRAYLENGTH, POP, RETURN],
    ]
    .concat();
    class.method(
        "onEntityRemove",
        &format!("(L{marker};)V"),
        1,
        3,
        code,
        None,
    );
    class.build()
}

/// `BeaconSpawnController controller = beacon.getSpawnController(); controller.registerBeacon(beacon);`
pub fn beacon_add_remove_system_class() -> Vec<u8> {
    let mut class = ClassBuilder::new(&internal(BEACON_ADD_REMOVE_SYSTEM));
    let beacon = "com/hypixel/hytale/server/spawning/beacons/LegacySpawnBeaconEntity";
    let controller = internal(BEACON_SPAWN_CONTROLLER);
    let get_controller =
        class.method_ref(beacon, "getSpawnController", &format!("()L{controller};"));
    let register = class.method_ref(&controller, "registerBeacon", &format!("(L{beacon};)V"));
    let code = [
        vec![ALOAD_1],
        op_u16(INVOKEVIRTUAL, get_controller),
        vec![ASTORE_2, ALOAD_2, ALOAD_1],
        op_u16(INVOKEVIRTUAL, register),
        vec![RETURN],
    ]
    .concat();
    class.method("onEntityAdded", &format!("(L{beacon};)V"), 2, 3, code, None);
    class.build()
}

/// ```text
/// TrackedPlacement placement = (TrackedPlacement) store.getComponent(ref, TYPE);
/// String blockName = placement.blockName;
/// this.counter.untrackBlock(blockName.toLowerCase());
/// ```
pub fn tracked_placement_class() -> Vec<u8> {
    let owner = internal(TRACKED_PLACEMENT_ON_ADD_REMOVE);
    let mut class = ClassBuilder::new(&owner);
    let placement = "com/hypixel/hytale/server/core/modules/interaction/blocktrack/TrackedPlacement";
    let counter_class = "com/hypixel/hytale/server/core/modules/interaction/blocktrack/BlockCounter";
    let reference = "com/hypixel/hytale/component/Ref";
    let store = "com/hypixel/hytale/component/Store";
    let component_type = "com/hypixel/hytale/component/ComponentType";
    let type_field = class.field(placement, "TYPE", &format!("L{component_type};"));
    let get_component = class.method_ref(
        store,
        "getComponent",
        &format!("(L{reference};L{component_type};)Lcom/hypixel/hytale/component/Component;"),
    );
    let cast = class.class(placement);
    let block_name = class.field(placement, "blockName", "Ljava/lang/String;");
    let counter = class.field(&owner, "counter", &format!("L{counter_class};"));
    let lower = class.method_ref("java/lang/String", "toLowerCase", "()Ljava/lang/String;");
    let untrack = class.method_ref(counter_class, "untrackBlock", "(Ljava/lang/String;)V");
    let code = [
        vec![ALOAD_2, ALOAD_1],
        op_u16(GETSTATIC, type_field),
        op_u16(INVOKEVIRTUAL, get_component),
        op_u16(CHECKCAST, cast),
        vec![ASTORE_3, ALOAD_3],
        op_u16(GETFIELD, block_name),
        vec![ASTORE, 4, ALOAD_0],
        op_u16(GETFIELD, counter),
        vec![ALOAD, 4],
        op_u16(INVOKEVIRTUAL, lower),
        op_u16(INVOKEVIRTUAL, untrack),
        vec![RETURN],
    ]
    .concat();
    class.method(
        "onEntityRemove",
        &format!("(L{reference};L{store};)V"),
        3,
        5,
        code,
        None,
    );
    class.build()
}

/// Every fixture with the dotted name the host would present.
pub fn catalog_targets() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        (INTERACTION_CHAIN, interaction_chain_class()),
        (WORLD, world_class()),
        (BLOCK_COMPONENT_CHUNK, block_component_chunk_class()),
        (BEACON_SPAWN_CONTROLLER, beacon_spawn_controller_class()),
        (UUID_SYSTEM, uuid_system_class()),
        (SPAWN_MARKER_ENTITY, spawn_marker_entity_class()),
        (TICKING_THREAD, ticking_thread_class()),
        (PACKET_HANDLER, packet_handler_class()),
        (UNIVERSE, universe_class()),
        (PLAYER_REMOVED_SYSTEM, player_removed_system_class().0),
        (MARKER_ADD_REMOVE_SYSTEM, marker_add_remove_system_class()),
        (BEACON_ADD_REMOVE_SYSTEM, beacon_add_remove_system_class()),
        (TRACKED_PLACEMENT_ON_ADD_REMOVE, tracked_placement_class()),
    ]
}
