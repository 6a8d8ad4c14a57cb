// Window parameters
pub const INPUT_LEN: usize = 50; // Number of time steps fed to the encoder
pub const TARGET_LEN: usize = 100; // Steps rolled out and scored during training
pub const STRIDE: usize = 1;
pub const HORIZON: usize = 900; // Steps rolled out at predict time

// Model parameters
pub const HIDDEN_SIZE: usize = 384;
pub const NUM_LAYERS: usize = 1;

// Optimization
pub const EPOCHS: usize = 100;
pub const BATCH_SIZE: usize = 32;
pub const LEARNING_RATE: f64 = 1e-3;
pub const LR_DECAY: f64 = 0.6; // Multiplier applied when the loss plateaus
pub const LR_PATIENCE: usize = 10;
pub const MIN_LEARNING_RATE: f64 = 3e-6;
pub const EARLY_STOPPING_PATIENCE: usize = 20;
pub const MIN_DELTA: f64 = 0.0;
pub const CHECKPOINT_INTERVAL: usize = 10;
pub const SEED: u64 = 42;

// Data preprocessing
pub const TRAIN_SPLIT_RATIO: f64 = 0.89;
pub const VALIDATION_SPLIT_RATIO: f64 = 0.11;
pub const MIN_SCALE: f64 = 1e-12; // Below this a feature is treated as constant

// Paths
pub const DATA_PATH: &str = "data/Pr07_uytheta_40_trainval.csv";
pub const CHECKPOINT_PATH: &str = "results/checkpoints";
pub const CHECKPOINT_NAME: &str = "gru_forecaster";
pub const HISTORY_FILE_NAME: &str = "history.json";
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
