//! Feature encoders - turn flat engine observations into fixed-size features
//!
//! Both encoders consume a `[batch, obs_len]` float tensor whose categorical
//! fields hold integer codes, and produce `[batch, output_size]` features.

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{relu, tanh};
use serde::{Deserialize, Serialize};

use super::layout::{LayoutError, MAP_CELL_FACTORS, MultiHotLayout, ObsLayout};

/// Which observation scheme the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum EncoderKind {
    /// Per-entity slots with embedded type codes plus an embedded map grid
    EntityEmbedding,
    /// Map grid of packed categorical factors expanded to multi-hot channels
    MultiHot,
}

/// Configuration for the observation encoder
#[derive(Config, Debug)]
pub struct EncoderConfig {
    #[config(default = "EncoderKind::EntityEmbedding")]
    pub kind: EncoderKind,
    #[config(default = "ObsLayout::default()")]
    pub layout: ObsLayout,
    #[config(default = "MultiHotLayout::default()")]
    pub multi_hot: MultiHotLayout,
    #[config(default = 4)]
    pub weapon_embedding_dims: usize,
    #[config(default = 2)]
    pub wall_embedding_dims: usize,
    #[config(default = 4)]
    pub map_cell_embedding_dims: usize,
    #[config(default = 32)]
    pub conv_channels: usize,
    /// Width of the scalar projection in the multi-hot encoder
    #[config(default = 64)]
    pub scalar_hidden_size: usize,
    #[config(default = 256)]
    pub output_size: usize,
}

impl EncoderConfig {
    /// Flat observation length the selected scheme expects
    pub fn observation_size(&self) -> usize {
        match self.kind {
            EncoderKind::EntityEmbedding => self.layout.total_len(),
            EncoderKind::MultiHot => self.multi_hot.total_len(),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ObservationEncoder<B>, LayoutError> {
        match self.kind {
            EncoderKind::EntityEmbedding => Ok(ObservationEncoder::EntityEmbedding(
                EntityEmbeddingEncoder::new(device, self)?,
            )),
            EncoderKind::MultiHot => Ok(ObservationEncoder::MultiHot(MultiHotEncoder::new(
                device, self,
            )?)),
        }
    }
}

/// Common interface of the observation encoders
pub trait FeatureEncoder<B: Backend> {
    /// Flat observation length consumed per agent
    fn observation_size(&self) -> usize;

    /// Feature width produced per agent
    fn output_size(&self) -> usize;

    /// `[batch, observation_size]` -> `[batch, output_size]`.
    ///
    /// Categorical codes must already be in range; engine data goes through
    /// [`FeatureEncoder::encode_observations`] instead.
    fn encode(&self, obs: Tensor<B, 2>) -> Tensor<B, 2>;

    /// Check one flat observation against the encoder's layout
    fn check_observation(&self, obs: &[f32]) -> Result<(), LayoutError>;

    /// Validate every row of a flat `[batch * observation_size]` buffer,
    /// then encode it. Out-of-range codes are rejected, never clamped.
    fn encode_observations(
        &self,
        observations: &[f32],
        device: &B::Device,
    ) -> Result<Tensor<B, 2>, LayoutError> {
        let width = self.observation_size();
        if observations.is_empty() || observations.len() % width != 0 {
            return Err(LayoutError::RaggedBatch {
                len: observations.len(),
                width,
            });
        }
        for row in observations.chunks(width) {
            self.check_observation(row)?;
        }

        let batch = observations.len() / width;
        let obs = Tensor::<B, 1>::from_floats(observations, device).reshape([batch, width]);
        Ok(self.encode(obs))
    }
}

/// Two strided convolutions over a channel-first map image, flattened
#[derive(Module, Debug)]
pub struct MapCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> MapCnn<B> {
    pub fn new(device: &B::Device, in_channels: usize, channels: usize) -> Self {
        Self {
            conv1: Conv2dConfig::new([in_channels, channels], [5, 5])
                .with_stride([2, 2])
                .init(device),
            conv2: Conv2dConfig::new([channels, channels], [3, 3])
                .with_stride([2, 2])
                .init(device),
        }
    }

    pub fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.conv1.forward(image));
        let x = relu(self.conv2.forward(x));
        x.flatten(1, 3)
    }

    /// Flattened output width for a `columns x rows` map, measured with one
    /// forward pass over an all-zero image so it never depends on live data.
    pub fn output_size(
        &self,
        device: &B::Device,
        in_channels: usize,
        columns: usize,
        rows: usize,
    ) -> usize {
        let dummy = Tensor::<B, 4>::zeros([1, in_channels, columns, rows], device);
        self.forward(dummy).dims()[1]
    }
}

fn projection<B: Backend>(device: &B::Device, input: usize, output: usize) -> Linear<B> {
    LinearConfig::new(input, output)
        .with_initializer(Initializer::XavierUniform {
            gain: std::f64::consts::SQRT_2,
        })
        .init(device)
}

/// Encoder for the entity-embedding layout
#[derive(Module, Debug)]
pub struct EntityEmbeddingEncoder<B: Backend> {
    layout: Ignored<ObsLayout>,
    weapon_embedding: Embedding<B>,
    wall_embedding: Embedding<B>,
    map_embedding: Embedding<B>,
    map_cnn: MapCnn<B>,
    projection: Linear<B>,
    output_size: usize,
}

impl<B: Backend> EntityEmbeddingEncoder<B> {
    pub fn new(device: &B::Device, config: &EncoderConfig) -> Result<Self, LayoutError> {
        let layout = config.layout.clone();
        layout.validate()?;

        let weapon_dims = config.weapon_embedding_dims;
        let wall_dims = config.wall_embedding_dims;
        let map_dims = config.map_cell_embedding_dims;

        let map_cnn = MapCnn::new(device, map_dims, config.conv_channels);
        let cnn_size = map_cnn.output_size(device, map_dims, layout.map_columns, layout.map_rows);

        // each slot swaps its type code for an embedding
        let features_size = layout.scalar_size
            + layout.num_drones * (weapon_dims + layout.drone_size - 1)
            + layout.num_projectiles * (weapon_dims + layout.projectile_size - 1)
            + layout.num_floating_walls * (wall_dims + layout.floating_wall_size - 1)
            + cnn_size;

        tracing::debug!(
            "Entity encoder: obs_len={}, cnn_size={}, features={}",
            layout.total_len(),
            cnn_size,
            features_size
        );

        Ok(Self {
            weapon_embedding: EmbeddingConfig::new(layout.weapon_vocab(), weapon_dims).init(device),
            wall_embedding: EmbeddingConfig::new(layout.wall_vocab(), wall_dims).init(device),
            map_embedding: EmbeddingConfig::new(layout.map_cell_vocab(), map_dims).init(device),
            map_cnn,
            projection: projection(device, features_size, config.output_size),
            output_size: config.output_size,
            layout: Ignored(layout),
        })
    }

    /// Embed the leading code of each slot and keep the remaining fields,
    /// returning `[embedding, fields]` pairs in slot order.
    fn embed_slots(
        obs: &Tensor<B, 2>,
        table: &Embedding<B>,
        offset: usize,
        count: usize,
        size: usize,
    ) -> Vec<Tensor<B, 2>> {
        let [batch, _] = obs.dims();
        let mut parts = Vec::with_capacity(count * 2);

        for slot in 0..count {
            let start = offset + slot * size;
            let code = obs.clone().slice([0..batch, start..start + 1]).int();
            let embedded = table.forward(code);
            let [_, _, dims] = embedded.dims();
            parts.push(embedded.reshape([batch, dims]));

            if size > 1 {
                parts.push(obs.clone().slice([0..batch, start + 1..start + size]));
            }
        }

        parts
    }
}

impl<B: Backend> FeatureEncoder<B> for EntityEmbeddingEncoder<B> {
    fn observation_size(&self) -> usize {
        self.layout.total_len()
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn encode(&self, obs: Tensor<B, 2>) -> Tensor<B, 2> {
        let layout = &self.layout;
        let [batch, _] = obs.dims();

        let mut features = Vec::new();
        features.extend(Self::embed_slots(
            &obs,
            &self.weapon_embedding,
            layout.drone_offset(),
            layout.num_drones,
            layout.drone_size,
        ));
        features.extend(Self::embed_slots(
            &obs,
            &self.weapon_embedding,
            layout.projectile_offset(),
            layout.num_projectiles,
            layout.projectile_size,
        ));
        features.extend(Self::embed_slots(
            &obs,
            &self.wall_embedding,
            layout.floating_wall_offset(),
            layout.num_floating_walls,
            layout.floating_wall_size,
        ));

        let map_start = layout.map_offset();
        let codes = obs
            .clone()
            .slice([0..batch, map_start..map_start + layout.map_cells()])
            .int();
        let embedded = self.map_embedding.forward(codes);
        let [_, _, dims] = embedded.dims();
        let image = embedded
            .reshape([batch, layout.map_columns, layout.map_rows, dims])
            .permute([0, 3, 1, 2]);
        features.push(self.map_cnn.forward(image));

        if layout.scalar_size > 0 {
            features.push(obs.slice([0..batch, 0..layout.scalar_size]));
        }

        tanh(self.projection.forward(Tensor::cat(features, 1)))
    }

    fn check_observation(&self, obs: &[f32]) -> Result<(), LayoutError> {
        self.layout.check_observation(obs)
    }
}

/// Encoder for the multi-hot layout
#[derive(Module, Debug)]
pub struct MultiHotEncoder<B: Backend> {
    layout: Ignored<MultiHotLayout>,
    map_cnn: MapCnn<B>,
    scalar_projection: Linear<B>,
    projection: Linear<B>,
    output_size: usize,
}

impl<B: Backend> MultiHotEncoder<B> {
    pub fn new(device: &B::Device, config: &EncoderConfig) -> Result<Self, LayoutError> {
        let layout = config.multi_hot.clone();
        layout.validate()?;

        let width = layout.width();
        let map_cnn = MapCnn::new(device, width, config.conv_channels);
        let cnn_size = map_cnn.output_size(device, width, layout.map_columns, layout.map_rows);

        tracing::debug!(
            "Multi-hot encoder: obs_len={}, channels={}, cnn_size={}",
            layout.total_len(),
            width,
            cnn_size
        );

        Ok(Self {
            map_cnn,
            scalar_projection: projection(device, layout.scalar_size, config.scalar_hidden_size),
            projection: projection(
                device,
                cnn_size + config.scalar_hidden_size,
                config.output_size,
            ),
            output_size: config.output_size,
            layout: Ignored(layout),
        })
    }

    /// Expand packed cell codes into a `[batch, width, columns, rows]` image
    /// with one hot channel per factor.
    pub fn multi_hot(&self, obs: &Tensor<B, 2>) -> Tensor<B, 4> {
        let layout = &self.layout;
        let device = obs.device();
        let [batch, _] = obs.dims();
        let cells = layout.map_cells();
        let width = layout.width();

        let codes = obs
            .clone()
            .slice([0..batch, 0..layout.scalar_offset()])
            .reshape([batch, cells, MAP_CELL_FACTORS]);

        let offsets: Vec<f32> = layout.offsets().iter().map(|&o| o as f32).collect();
        let offsets =
            Tensor::<B, 1>::from_floats(offsets.as_slice(), &device).reshape([1, 1, MAP_CELL_FACTORS]);
        let indices = (codes + offsets).int();

        let ones = Tensor::<B, 3>::ones([batch, cells, MAP_CELL_FACTORS], &device);
        Tensor::<B, 3>::zeros([batch, cells, width], &device)
            .scatter(2, indices, ones)
            .reshape([batch, layout.map_columns, layout.map_rows, width])
            .permute([0, 3, 1, 2])
    }
}

impl<B: Backend> FeatureEncoder<B> for MultiHotEncoder<B> {
    fn observation_size(&self) -> usize {
        self.layout.total_len()
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn encode(&self, obs: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _] = obs.dims();
        let map_feature = self.map_cnn.forward(self.multi_hot(&obs));

        let scalar = obs.slice([0..batch, self.layout.scalar_offset()..self.layout.total_len()]);
        let scalar_feature = relu(self.scalar_projection.forward(scalar));

        tanh(
            self.projection
                .forward(Tensor::cat(vec![map_feature, scalar_feature], 1)),
        )
    }

    fn check_observation(&self, obs: &[f32]) -> Result<(), LayoutError> {
        self.layout.check_observation(obs)
    }
}

/// Encoder selected by configuration
#[derive(Module, Debug)]
pub enum ObservationEncoder<B: Backend> {
    EntityEmbedding(EntityEmbeddingEncoder<B>),
    MultiHot(MultiHotEncoder<B>),
}

impl<B: Backend> FeatureEncoder<B> for ObservationEncoder<B> {
    fn observation_size(&self) -> usize {
        match self {
            Self::EntityEmbedding(encoder) => encoder.observation_size(),
            Self::MultiHot(encoder) => encoder.observation_size(),
        }
    }

    fn output_size(&self) -> usize {
        match self {
            Self::EntityEmbedding(encoder) => encoder.output_size(),
            Self::MultiHot(encoder) => encoder.output_size(),
        }
    }

    fn encode(&self, obs: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::EntityEmbedding(encoder) => encoder.encode(obs),
            Self::MultiHot(encoder) => encoder.encode(obs),
        }
    }

    fn check_observation(&self, obs: &[f32]) -> Result<(), LayoutError> {
        match self {
            Self::EntityEmbedding(encoder) => encoder.check_observation(obs),
            Self::MultiHot(encoder) => encoder.check_observation(obs),
        }
    }
}
