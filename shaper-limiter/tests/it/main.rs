mod mock;
mod shaping;
