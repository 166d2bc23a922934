use slotmap::new_key_type;

pub type TileIndex = u32;
pub type Owner = u8;
pub type StationId = u16;
pub type DepotId = u16;
pub type EngineId = u16;

new_key_type! {
    /// Handle of a single vehicle; a train is named by the handle of its front vehicle.
    pub struct VehicleId;
    /// Handle of a (possibly shared) order list.
    pub struct OrderListId;
}

/// Short printable form of a slotmap handle, stable across runs.
pub fn short_id<K: slotmap::Key>(k: K) -> u64 {
    k.data().as_ffi() & 0xffff_ffff
}
