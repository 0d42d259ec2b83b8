pub mod tf;
