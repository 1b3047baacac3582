//! Database entities

pub mod domain;

pub use domain::Entity as Domain;

pub mod prelude {
    pub use super::domain::Entity as Domain;
}
