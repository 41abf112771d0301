pub mod prelude {
    pub use entity::prelude::*;
    pub use entity::progress_entry;
    pub use sea_orm::prelude::*;
    pub use sea_orm::sea_query::{Index, OnConflict};
    pub use sea_orm::{ActiveValue, ConnectionTrait, Database, DatabaseConnection, Schema};
}
