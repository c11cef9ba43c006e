pub mod kids;
