pub mod lexical;
pub mod vector;

pub use lexical::{tokenize, Bm25Index, Bm25Params};
pub use vector::{FlatVectorIndex, VectorIndexBuilder};
