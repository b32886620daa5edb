pub mod ints;
