pub mod index;
pub mod pes;
pub mod remux;
pub mod ring;
pub mod still;
pub mod ts;
