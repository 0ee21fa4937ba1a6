pub mod resources;
pub mod uploads;

pub use resources::{
    extension_of, MaterialInfo, ModelInfo, Resource, ResourceKind, StatusChange, TextureInfo,
};
pub use uploads::UploadRecord;
