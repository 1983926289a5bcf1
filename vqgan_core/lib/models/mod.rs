pub mod vqgan;
