pub mod order_book;

pub use order_book::{OrderBooks, BOOK_UPDATE_DEPTH};
