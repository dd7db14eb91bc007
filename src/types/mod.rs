pub mod references;
pub mod requests;
pub mod responses;
pub mod signatures;
pub mod storage_types;
pub mod updates;
pub mod values;

pub use references::{StorageReference, TransactionReference};
pub use requests::TransactionRequest;
pub use responses::TransactionResponse;
pub use signatures::{ConstructorSignature, FieldSignature, MethodSignature};
pub use storage_types::StorageType;
pub use updates::Update;
pub use values::StorageValue;
