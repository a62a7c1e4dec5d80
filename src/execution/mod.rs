// =============================================================================
// Execution plane: order lifecycle, state machine, artifact schema
// =============================================================================

pub mod order_manager;
pub mod state_machine;
pub mod update_schema;
