pub mod distortion;
pub mod hooks;
pub mod layers;
pub mod loss;
mod model;
pub mod resnet;

pub use model::{Mode, Model};
pub use resnet::{Architecture, ResNet, ResNetConfig, resnet18, resnet34};
