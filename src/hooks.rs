// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and intervention.
//!
//! Provides [`HookPoint`] (named locations in a forward pass), [`Hook`]
//! (callables attached to them), [`HookFilter`] (which points a hook or
//! capture applies to), [`HookSpec`] (per-call instrumentation),
//! [`HookCache`] (captured tensors), and [`HookContext`] (the pass-through
//! every architecture block calls at each hook point).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// Layer addressing
// ---------------------------------------------------------------------------

/// Which stack of blocks a layer index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stack {
    /// The single stack of a decoder-only or encoder-only model (`blocks`).
    Blocks,
    /// The encoder stack of an encoder-decoder model (`encoder`).
    Encoder,
    /// The decoder stack of an encoder-decoder model (`decoder`).
    Decoder,
}

impl Stack {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Encoder => "encoder",
            Self::Decoder => "decoder",
        }
    }

    const fn final_norm(self) -> &'static str {
        match self {
            Self::Blocks => "ln_final",
            Self::Encoder => "encoder_final_ln",
            Self::Decoder => "decoder_final_ln",
        }
    }
}

/// A block index within a [`Stack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Layer {
    /// Stack the block belongs to.
    pub stack: Stack,
    /// Zero-based block index.
    pub index: usize,
}

impl Layer {
    /// Block `index` of a single-stack model.
    #[must_use]
    pub const fn blocks(index: usize) -> Self {
        Self {
            stack: Stack::Blocks,
            index,
        }
    }

    /// Encoder block `index`.
    #[must_use]
    pub const fn encoder(index: usize) -> Self {
        Self {
            stack: Stack::Encoder,
            index,
        }
    }

    /// Decoder block `index`.
    #[must_use]
    pub const fn decoder(index: usize) -> Self {
        Self {
            stack: Stack::Decoder,
            index,
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stack.prefix(), self.index)
    }
}

/// Self attention or cross attention inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttnSite {
    /// `attn`
    SelfAttn,
    /// `cross_attn`
    CrossAttn,
}

impl AttnSite {
    const fn name(self) -> &'static str {
        match self {
            Self::SelfAttn => "attn",
            Self::CrossAttn => "cross_attn",
        }
    }
}

/// Hook points inside an attention layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttnHook {
    /// Queries `[batch, pos, head, d_head]`.
    Q,
    /// Keys `[batch, pos, kv_head, d_head]`.
    K,
    /// Values `[batch, pos, kv_head, d_head]`.
    V,
    /// Queries after rotary embedding.
    RotQ,
    /// Keys after rotary embedding.
    RotK,
    /// Pre-softmax scores `[batch, head, query_pos, key_pos]`.
    Scores,
    /// Post-softmax pattern `[batch, head, query_pos, key_pos]`.
    Pattern,
    /// Mixed values `[batch, pos, head, d_head]`.
    Z,
    /// Per-head output `[batch, pos, head, d_model]`.
    Result,
}

impl AttnHook {
    const fn name(self) -> &'static str {
        match self {
            Self::Q => "hook_q",
            Self::K => "hook_k",
            Self::V => "hook_v",
            Self::RotQ => "hook_rot_q",
            Self::RotK => "hook_rot_k",
            Self::Scores => "hook_attn_scores",
            Self::Pattern => "hook_pattern",
            Self::Z => "hook_z",
            Self::Result => "hook_result",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "hook_q" => Self::Q,
            "hook_k" => Self::K,
            "hook_v" => Self::V,
            "hook_rot_q" => Self::RotQ,
            "hook_rot_k" => Self::RotK,
            "hook_attn_scores" => Self::Scores,
            "hook_pattern" => Self::Pattern,
            "hook_z" => Self::Z,
            "hook_result" => Self::Result,
            _ => return None,
        })
    }

    /// Axis holding the head index, for activations that have one.
    #[must_use]
    pub const fn head_axis(self) -> usize {
        match self {
            Self::Scores | Self::Pattern => 1,
            _ => 2,
        }
    }
}

/// A normalization layer that exposes `hook_scale` / `hook_normalized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormSite {
    /// `{layer}.ln1`
    Ln1(Layer),
    /// `{layer}.ln2`
    Ln2(Layer),
    /// `{layer}.ln3` (decoder blocks with cross attention)
    Ln3(Layer),
    /// Final norm of a stack (`ln_final`, `encoder_final_ln`, `decoder_final_ln`).
    Final(Stack),
    /// Embedding layer norm of an encoder (`embed_ln`).
    EmbedLn,
    /// Layer norm of the masked-LM head (`mlm_head.ln`).
    MlmHead,
}

impl fmt::Display for NormSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ln1(l) => write!(f, "{l}.ln1"),
            Self::Ln2(l) => write!(f, "{l}.ln2"),
            Self::Ln3(l) => write!(f, "{l}.ln3"),
            Self::Final(stack) => write!(f, "{}", stack.final_norm()),
            Self::EmbedLn => write!(f, "embed_ln"),
            Self::MlmHead => write!(f, "mlm_head.ln"),
        }
    }
}

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or modified.
///
/// Renders to and parses from the `TransformerLens` dotted names via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// ```
/// use candle_lens::HookPoint;
///
/// let hook = HookPoint::pattern(5);
/// assert_eq!(hook.to_string(), "blocks.5.attn.hook_pattern");
///
/// let parsed: HookPoint = "blocks.5.attn.hook_pattern".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    // -- Embedding --
    /// Token embedding (`hook_embed`).
    Embed,
    /// Learned positional embedding (`hook_pos_embed`).
    PosEmbed,
    /// Token-type embedding of an encoder (`hook_token_type_embed`).
    TokenTypeEmbed,
    /// Sum of all embeddings before any block (`hook_full_embed`).
    FullEmbed,

    // -- Per block --
    /// Residual stream entering the block (`{layer}.hook_resid_pre`).
    ResidPre(Layer),
    /// Self-attention output (`{layer}.hook_attn_out`).
    AttnOut(Layer),
    /// Residual after self attention (`{layer}.hook_resid_mid`).
    ResidMid(Layer),
    /// Post-norm residual after attention (`{layer}.hook_normalized_resid_mid`).
    NormalizedResidMid(Layer),
    /// Cross-attention output (`{layer}.hook_cross_attn_out`).
    CrossAttnOut(Layer),
    /// Residual after cross attention (`{layer}.hook_resid_mid_cross`).
    ResidMidCross(Layer),
    /// MLP output (`{layer}.hook_mlp_out`).
    MlpOut(Layer),
    /// Residual leaving the block (`{layer}.hook_resid_post`).
    ResidPost(Layer),
    /// Post-norm residual leaving the block (`{layer}.hook_normalized_resid_post`).
    NormalizedResidPost(Layer),

    // -- MLP internals --
    /// MLP pre-activation (`{layer}.mlp.hook_pre`).
    MlpPre(Layer),
    /// Linear branch of a gated MLP (`{layer}.mlp.hook_pre_linear`).
    MlpPreLinear(Layer),
    /// MLP post-activation (`{layer}.mlp.hook_post`).
    MlpPost(Layer),

    // -- Attention internals --
    /// Activation inside an attention layer (`{layer}.attn.hook_*`).
    Attn(Layer, AttnSite, AttnHook),

    // -- Normalization --
    /// Normalization scale `[batch, pos, 1]` (`{norm}.hook_scale`).
    NormScale(NormSite),
    /// Normalized value before the affine step (`{norm}.hook_normalized`).
    NormNormalized(NormSite),

    // -- Escape hatch --
    /// Hook point not covered by the enum.
    Custom(String),
}

impl HookPoint {
    /// `blocks.{layer}.hook_resid_pre`
    #[must_use]
    pub const fn resid_pre(layer: usize) -> Self {
        Self::ResidPre(Layer::blocks(layer))
    }

    /// `blocks.{layer}.hook_resid_mid`
    #[must_use]
    pub const fn resid_mid(layer: usize) -> Self {
        Self::ResidMid(Layer::blocks(layer))
    }

    /// `blocks.{layer}.hook_resid_post`
    #[must_use]
    pub const fn resid_post(layer: usize) -> Self {
        Self::ResidPost(Layer::blocks(layer))
    }

    /// `blocks.{layer}.hook_attn_out`
    #[must_use]
    pub const fn attn_out(layer: usize) -> Self {
        Self::AttnOut(Layer::blocks(layer))
    }

    /// `blocks.{layer}.hook_mlp_out`
    #[must_use]
    pub const fn mlp_out(layer: usize) -> Self {
        Self::MlpOut(Layer::blocks(layer))
    }

    /// `blocks.{layer}.mlp.hook_pre`
    #[must_use]
    pub const fn mlp_pre(layer: usize) -> Self {
        Self::MlpPre(Layer::blocks(layer))
    }

    /// `blocks.{layer}.mlp.hook_post`
    #[must_use]
    pub const fn mlp_post(layer: usize) -> Self {
        Self::MlpPost(Layer::blocks(layer))
    }

    /// `blocks.{layer}.attn.{hook}`
    #[must_use]
    pub const fn attn(layer: usize, hook: AttnHook) -> Self {
        Self::Attn(Layer::blocks(layer), AttnSite::SelfAttn, hook)
    }

    /// `blocks.{layer}.attn.hook_pattern`
    #[must_use]
    pub const fn pattern(layer: usize) -> Self {
        Self::attn(layer, AttnHook::Pattern)
    }

    /// `blocks.{layer}.attn.hook_attn_scores`
    #[must_use]
    pub const fn attn_scores(layer: usize) -> Self {
        Self::attn(layer, AttnHook::Scores)
    }

    /// `blocks.{layer}.attn.hook_z`
    #[must_use]
    pub const fn z(layer: usize) -> Self {
        Self::attn(layer, AttnHook::Z)
    }

    /// `blocks.{layer}.attn.hook_result`
    #[must_use]
    pub const fn result(layer: usize) -> Self {
        Self::attn(layer, AttnHook::Result)
    }

    /// `blocks.{layer}.ln1.hook_scale`
    #[must_use]
    pub const fn ln1_scale(layer: usize) -> Self {
        Self::NormScale(NormSite::Ln1(Layer::blocks(layer)))
    }

    /// `blocks.{layer}.ln2.hook_scale`
    #[must_use]
    pub const fn ln2_scale(layer: usize) -> Self {
        Self::NormScale(NormSite::Ln2(Layer::blocks(layer)))
    }

    /// `ln_final.hook_scale`
    #[must_use]
    pub const fn ln_final_scale() -> Self {
        Self::NormScale(NormSite::Final(Stack::Blocks))
    }

    /// The block this point lives in, if any.
    #[must_use]
    pub const fn layer(&self) -> Option<Layer> {
        match self {
            Self::ResidPre(l)
            | Self::AttnOut(l)
            | Self::ResidMid(l)
            | Self::NormalizedResidMid(l)
            | Self::CrossAttnOut(l)
            | Self::ResidMidCross(l)
            | Self::MlpOut(l)
            | Self::ResidPost(l)
            | Self::NormalizedResidPost(l)
            | Self::MlpPre(l)
            | Self::MlpPreLinear(l)
            | Self::MlpPost(l)
            | Self::Attn(l, _, _)
            | Self::NormScale(NormSite::Ln1(l) | NormSite::Ln2(l) | NormSite::Ln3(l))
            | Self::NormNormalized(NormSite::Ln1(l) | NormSite::Ln2(l) | NormSite::Ln3(l)) => {
                Some(*l)
            }
            _ => None,
        }
    }

    /// Axis holding the head index, for per-head activations.
    #[must_use]
    pub const fn head_axis(&self) -> Option<usize> {
        match self {
            Self::Attn(_, _, hook) => Some(hook.head_axis()),
            _ => None,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::PosEmbed => write!(f, "hook_pos_embed"),
            Self::TokenTypeEmbed => write!(f, "hook_token_type_embed"),
            Self::FullEmbed => write!(f, "hook_full_embed"),
            Self::ResidPre(l) => write!(f, "{l}.hook_resid_pre"),
            Self::AttnOut(l) => write!(f, "{l}.hook_attn_out"),
            Self::ResidMid(l) => write!(f, "{l}.hook_resid_mid"),
            Self::NormalizedResidMid(l) => write!(f, "{l}.hook_normalized_resid_mid"),
            Self::CrossAttnOut(l) => write!(f, "{l}.hook_cross_attn_out"),
            Self::ResidMidCross(l) => write!(f, "{l}.hook_resid_mid_cross"),
            Self::MlpOut(l) => write!(f, "{l}.hook_mlp_out"),
            Self::ResidPost(l) => write!(f, "{l}.hook_resid_post"),
            Self::NormalizedResidPost(l) => write!(f, "{l}.hook_normalized_resid_post"),
            Self::MlpPre(l) => write!(f, "{l}.mlp.hook_pre"),
            Self::MlpPreLinear(l) => write!(f, "{l}.mlp.hook_pre_linear"),
            Self::MlpPost(l) => write!(f, "{l}.mlp.hook_post"),
            Self::Attn(l, site, hook) => write!(f, "{l}.{}.{}", site.name(), hook.name()),
            Self::NormScale(site) => write!(f, "{site}.hook_scale"),
            Self::NormNormalized(site) => write!(f, "{site}.hook_normalized"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
///
/// Unknown strings produce [`HookPoint::Custom`] rather than an error.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

/// Allow `spec.capture("blocks.5.attn.hook_pattern")` via `Into<HookPoint>`.
impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    parse_known(s).unwrap_or_else(|| HookPoint::Custom(s.to_string()))
}

fn parse_known(s: &str) -> Option<HookPoint> {
    match s {
        "hook_embed" => return Some(HookPoint::Embed),
        "hook_pos_embed" => return Some(HookPoint::PosEmbed),
        "hook_token_type_embed" => return Some(HookPoint::TokenTypeEmbed),
        "hook_full_embed" => return Some(HookPoint::FullEmbed),
        _ => {}
    }

    // Root-level norms.
    let root_norms = [
        ("ln_final.", NormSite::Final(Stack::Blocks)),
        ("encoder_final_ln.", NormSite::Final(Stack::Encoder)),
        ("decoder_final_ln.", NormSite::Final(Stack::Decoder)),
        ("embed_ln.", NormSite::EmbedLn),
        ("mlm_head.ln.", NormSite::MlmHead),
    ];
    for (prefix, site) in root_norms {
        if let Some(hook) = s.strip_prefix(prefix) {
            return parse_norm_hook(site, hook);
        }
    }

    // "{stack}.{layer}.{suffix}"
    let (stack_name, rest) = s.split_once('.')?;
    let stack = match stack_name {
        "blocks" => Stack::Blocks,
        "encoder" => Stack::Encoder,
        "decoder" => Stack::Decoder,
        _ => return None,
    };
    let (index, suffix) = rest.split_once('.')?;
    let layer = Layer {
        stack,
        index: index.parse().ok()?,
    };

    let point = match suffix {
        "hook_resid_pre" => HookPoint::ResidPre(layer),
        "hook_attn_out" => HookPoint::AttnOut(layer),
        "hook_resid_mid" => HookPoint::ResidMid(layer),
        "hook_normalized_resid_mid" => HookPoint::NormalizedResidMid(layer),
        "hook_cross_attn_out" => HookPoint::CrossAttnOut(layer),
        "hook_resid_mid_cross" => HookPoint::ResidMidCross(layer),
        "hook_mlp_out" => HookPoint::MlpOut(layer),
        "hook_resid_post" => HookPoint::ResidPost(layer),
        "hook_normalized_resid_post" => HookPoint::NormalizedResidPost(layer),
        "mlp.hook_pre" => HookPoint::MlpPre(layer),
        "mlp.hook_pre_linear" => HookPoint::MlpPreLinear(layer),
        "mlp.hook_post" => HookPoint::MlpPost(layer),
        _ => {
            let (module, hook) = suffix.split_once('.')?;
            return match module {
                "attn" => Some(HookPoint::Attn(layer, AttnSite::SelfAttn, AttnHook::parse(hook)?)),
                "cross_attn" => Some(HookPoint::Attn(
                    layer,
                    AttnSite::CrossAttn,
                    AttnHook::parse(hook)?,
                )),
                "ln1" => parse_norm_hook(NormSite::Ln1(layer), hook),
                "ln2" => parse_norm_hook(NormSite::Ln2(layer), hook),
                "ln3" => parse_norm_hook(NormSite::Ln3(layer), hook),
                _ => None,
            };
        }
    };
    Some(point)
}

fn parse_norm_hook(site: NormSite, hook: &str) -> Option<HookPoint> {
    match hook {
        "hook_scale" => Some(HookPoint::NormScale(site)),
        "hook_normalized" => Some(HookPoint::NormNormalized(site)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// A built-in modification applied at a hook point.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Replace the tensor entirely with a provided value of the same shape.
    Replace(Tensor),

    /// Add a (broadcastable) tensor to the activation, e.g. a steering vector.
    Add(Tensor),

    /// Add a pre-softmax knockout mask.
    ///
    /// The mask contains `0.0` for positions to keep and `-inf` for
    /// positions to knock out.
    Knockout(Tensor),

    /// Multiply by a constant factor.
    Scale(f64),

    /// Zero the tensor.
    Zero,

    /// Zero the listed heads of a per-head activation (`hook_z`,
    /// `hook_pattern`, ...).
    ZeroHeads(Vec<usize>),
}

/// Apply a single [`Intervention`] to the activation at `point`.
///
/// # Shapes
/// - `tensor`: any shape (the activation at the hook point).
/// - returns: same shape as `tensor` (the caller checks this).
///
/// # Errors
///
/// Returns [`LensError::Hook`] for `ZeroHeads` on a point without a head
/// axis or with an out-of-range head, and [`LensError::Model`] if the
/// underlying tensor operation fails.
pub(crate) fn apply_intervention(
    tensor: &Tensor,
    point: &HookPoint,
    intervention: &Intervention,
) -> Result<Tensor> {
    match intervention {
        Intervention::Replace(replacement) => Ok(replacement.to_dtype(tensor.dtype())?),
        Intervention::Add(delta) => Ok(tensor.broadcast_add(&delta.to_dtype(tensor.dtype())?)?),
        Intervention::Knockout(mask) => {
            Ok(tensor.broadcast_add(&mask.to_dtype(tensor.dtype())?)?)
        }
        Intervention::Scale(factor) => Ok((tensor * *factor)?),
        Intervention::Zero => Ok(tensor.zeros_like()?),
        Intervention::ZeroHeads(heads) => zero_heads(tensor, point, heads),
    }
}

/// Multiply the head axis by a 0/1 keep mask.
fn zero_heads(tensor: &Tensor, point: &HookPoint, heads: &[usize]) -> Result<Tensor> {
    let axis = point
        .head_axis()
        .ok_or_else(|| LensError::Hook(format!("`{point}` has no head axis to zero")))?;
    let n_heads = tensor.dim(axis)?;
    let mut keep = vec![1.0_f32; n_heads];
    for &head in heads {
        let slot = keep.get_mut(head).ok_or_else(|| {
            LensError::Hook(format!(
                "head {head} out of range at `{point}` ({n_heads} heads)"
            ))
        })?;
        *slot = 0.0;
    }
    let mut shape = vec![1_usize; tensor.rank()];
    if let Some(dim) = shape.get_mut(axis) {
        *dim = n_heads;
    }
    let mask = Tensor::from_vec(keep, shape, tensor.device())?.to_dtype(tensor.dtype())?;
    Ok(tensor.broadcast_mul(&mask)?)
}

// ---------------------------------------------------------------------------
// Hook
// ---------------------------------------------------------------------------

/// Read-only hook callable.
pub type ObserveFn = dyn Fn(&Tensor, &HookPoint) -> Result<()> + Send + Sync;

/// Activation-replacing hook callable.
pub type TransformFn = dyn Fn(&Tensor, &HookPoint) -> Result<Tensor> + Send + Sync;

/// A callable attached to one or more hook points.
///
/// ```
/// use candle_lens::{Hook, Intervention};
///
/// let zero = Hook::Intervene(Intervention::Zero);
/// let double = Hook::transform(|t, _| Ok((t * 2.0)?));
/// let log = Hook::observe(|t, point| {
///     println!("{point}: {:?}", t.dims());
///     Ok(())
/// });
/// # let _ = (zero, double, log);
/// ```
#[derive(Clone)]
pub enum Hook {
    /// Reads the activation, never modifies it.
    Observe(Arc<ObserveFn>),
    /// Returns the activation that continues the forward pass.
    Transform(Arc<TransformFn>),
    /// One of the built-in [`Intervention`]s.
    Intervene(Intervention),
}

impl Hook {
    /// Wrap an observing closure.
    pub fn observe<F>(f: F) -> Self
    where
        F: Fn(&Tensor, &HookPoint) -> Result<()> + Send + Sync + 'static,
    {
        Self::Observe(Arc::new(f))
    }

    /// Wrap a transforming closure.
    pub fn transform<F>(f: F) -> Self
    where
        F: Fn(&Tensor, &HookPoint) -> Result<Tensor> + Send + Sync + 'static,
    {
        Self::Transform(Arc::new(f))
    }

    /// Run the hook on `tensor`, returning the activation to continue with.
    ///
    /// # Errors
    ///
    /// Propagates the callable's error, and returns [`LensError::Hook`] if a
    /// transform changes the activation's shape.
    pub fn apply(&self, tensor: Tensor, point: &HookPoint) -> Result<Tensor> {
        let out = match self {
            Self::Observe(f) => {
                f(&tensor, point)?;
                return Ok(tensor);
            }
            Self::Transform(f) => f(&tensor, point)?,
            Self::Intervene(intervention) => apply_intervention(&tensor, point, intervention)?,
        };
        if out.dims() != tensor.dims() {
            return Err(LensError::Hook(format!(
                "hook at `{point}` changed shape from {:?} to {:?}",
                tensor.dims(),
                out.dims()
            )));
        }
        Ok(out)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Observe(_) => write!(f, "Hook::Observe(..)"),
            Self::Transform(_) => write!(f, "Hook::Transform(..)"),
            Self::Intervene(i) => f.debug_tuple("Hook::Intervene").field(i).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// HookFilter
// ---------------------------------------------------------------------------

/// Hook point selection predicate.
pub type PointPredicate = dyn Fn(&HookPoint) -> bool + Send + Sync;

/// Selects the hook points a hook or capture applies to.
///
/// `&str` converts to [`HookFilter::Pattern`] when it contains `*`, and to
/// [`HookFilter::Exact`] otherwise.
///
/// ```
/// use candle_lens::{HookFilter, HookPoint};
///
/// let filter = HookFilter::from("blocks.*.attn.hook_pattern");
/// assert!(filter.matches(&HookPoint::pattern(3)));
/// assert!(!filter.matches(&HookPoint::z(3)));
/// ```
#[derive(Clone)]
pub enum HookFilter {
    /// Exactly one hook point.
    Exact(HookPoint),
    /// Glob over the dotted name; `*` matches any run of characters.
    Pattern(String),
    /// Arbitrary predicate.
    Predicate(Arc<PointPredicate>),
    /// Every hook point.
    All,
}

impl HookFilter {
    /// Wrap a predicate closure.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&HookPoint) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Whether `point` is selected.
    #[must_use]
    pub fn matches(&self, point: &HookPoint) -> bool {
        match self {
            Self::Exact(p) => p == point,
            Self::Pattern(pattern) => glob_match(pattern, &point.to_string()),
            Self::Predicate(f) => f(point),
            Self::All => true,
        }
    }
}

impl fmt::Debug for HookFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(p) => write!(f, "Exact({p})"),
            Self::Pattern(s) => write!(f, "Pattern({s:?})"),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
            Self::All => write!(f, "All"),
        }
    }
}

impl From<HookPoint> for HookFilter {
    fn from(point: HookPoint) -> Self {
        Self::Exact(point)
    }
}

impl From<&str> for HookFilter {
    fn from(s: &str) -> Self {
        if s.contains('*') {
            Self::Pattern(s.to_string())
        } else {
            Self::Exact(parse_hook_string(s))
        }
    }
}

/// Match `name` against a pattern where `*` stands for any run of characters.
fn glob_match(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return name.is_empty();
    };
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };
    let pieces: Vec<&str> = parts.collect();
    let Some((last, middle)) = pieces.split_last() else {
        // No `*` at all.
        return rest.is_empty();
    };
    for piece in middle {
        match rest.find(piece) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which hooks to run for one
/// forward call.
///
/// When empty, the forward pass has zero overhead (no clones, no name
/// formatting).
///
/// ```
/// use candle_lens::{HookPoint, HookSpec, Intervention};
///
/// let mut spec = HookSpec::new();
/// spec.capture(HookPoint::pattern(5))
///     .capture("blocks.*.hook_resid_post")
///     .intervene(HookPoint::z(2), Intervention::ZeroHeads(vec![3]));
/// assert!(spec.is_captured(&HookPoint::resid_post(7)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Capture requests.
    captures: Vec<HookFilter>,
    /// Hooks in registration order.
    hooks: Vec<(HookFilter, Hook)>,
}

impl HookSpec {
    /// Create an empty `HookSpec` (no captures, no hooks).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activations selected by `filter`.
    pub fn capture<F: Into<HookFilter>>(&mut self, filter: F) -> &mut Self {
        self.captures.push(filter.into());
        self
    }

    /// Attach `hook` to the points selected by `filter`.
    pub fn hook<F: Into<HookFilter>>(&mut self, filter: F, hook: Hook) -> &mut Self {
        self.hooks.push((filter.into(), hook));
        self
    }

    /// Register a built-in intervention.
    pub fn intervene<F: Into<HookFilter>>(
        &mut self,
        filter: F,
        intervention: Intervention,
    ) -> &mut Self {
        self.hook(filter, Hook::Intervene(intervention))
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, point: &HookPoint) -> bool {
        self.captures.iter().any(|f| f.matches(point))
    }

    /// Check whether this spec has no captures and no hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.hooks.is_empty()
    }

    /// Number of capture filters.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn num_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Iterate over hooks that apply at a specific hook point, in order.
    pub fn hooks_at<'a>(&'a self, point: &'a HookPoint) -> impl Iterator<Item = &'a Hook> + 'a {
        self.hooks
            .iter()
            .filter(move |(f, _)| f.matches(point))
            .map(|(_, hook)| hook)
    }

    /// Check whether any hook targets the given point.
    #[must_use]
    pub fn has_hook_at(&self, point: &HookPoint) -> bool {
        self.hooks.iter().any(|(f, _)| f.matches(point))
    }

    /// All capture and hook filters, for validation against a model.
    pub(crate) fn filters(&self) -> impl Iterator<Item = &HookFilter> {
        self.captures.iter().chain(self.hooks.iter().map(|(f, _)| f))
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output.
///
/// ```
/// use candle_lens::{HookCache, HookPoint};
/// use candle_core::{Device, Tensor};
///
/// let logits = Tensor::zeros((1, 10, 50), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
/// let pattern = Tensor::zeros((1, 4, 10, 10), candle_core::DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::pattern(1), pattern);
/// assert!(cache.get(&HookPoint::pattern(1)).is_some());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (typically logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Consume the cache, returning the output and the captures.
    #[must_use]
    pub fn into_parts(self) -> (Tensor, HashMap<HookPoint, Tensor>) {
        (self.output, self.captures)
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, point: &HookPoint) -> Option<&Tensor> {
        self.captures.get(point)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the hook point was not captured.
    pub fn require(&self, point: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(point)
            .ok_or_else(|| LensError::Hook(format!("hook point `{point}` was not captured")))
    }

    /// Store a captured activation.
    pub fn store(&mut self, point: HookPoint, tensor: Tensor) {
        self.captures.insert(point, tensor);
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// HookContext
// ---------------------------------------------------------------------------

/// Per-forward dispatch state threaded through every block.
///
/// Holds a snapshot of the persistent hooks taken when the pass starts,
/// the caller's [`HookSpec`], and the captures collected so far.
pub struct HookContext<'a> {
    persistent: Vec<(HookFilter, Hook)>,
    spec: &'a HookSpec,
    captures: HashMap<HookPoint, Tensor>,
    active: bool,
}

impl<'a> HookContext<'a> {
    /// Build a context from a registry snapshot and a per-call spec.
    #[must_use]
    pub fn new(persistent: Vec<(HookFilter, Hook)>, spec: &'a HookSpec) -> Self {
        let active = !persistent.is_empty() || !spec.is_empty();
        Self {
            persistent,
            spec,
            captures: HashMap::new(),
            active,
        }
    }

    /// Whether any hook or capture could fire.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Pass `tensor` through the hook point `point`.
    ///
    /// Runs the persistent hooks, then the spec's hooks in registration
    /// order, then records the resulting tensor if a capture filter
    /// selects `point`.
    ///
    /// # Errors
    ///
    /// Propagates hook errors (including shape changes).
    pub fn apply(&mut self, point: HookPoint, tensor: Tensor) -> Result<Tensor> {
        if !self.active {
            return Ok(tensor);
        }
        let mut tensor = tensor;
        for (filter, hook) in &self.persistent {
            if filter.matches(&point) {
                tensor = hook.apply(tensor, &point)?;
            }
        }
        for hook in self.spec.hooks_at(&point) {
            tensor = hook.apply(tensor, &point)?;
        }
        if self.spec.is_captured(&point) {
            self.captures.insert(point, tensor.clone());
        }
        Ok(tensor)
    }

    /// Whether anything listens at `point`; lets callers skip computing
    /// optional activations such as `hook_result`.
    #[must_use]
    pub fn wants(&self, point: &HookPoint) -> bool {
        self.active
            && (self.spec.is_captured(point)
                || self.spec.has_hook_at(point)
                || self.persistent.iter().any(|(f, _)| f.matches(point)))
    }

    /// Finish the pass, producing a [`HookCache`] around `output`.
    #[must_use]
    pub fn finish(self, output: Tensor) -> HookCache {
        HookCache {
            output,
            captures: self.captures,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::PosEmbed, "hook_pos_embed"),
            (HookPoint::TokenTypeEmbed, "hook_token_type_embed"),
            (HookPoint::FullEmbed, "hook_full_embed"),
            (HookPoint::resid_pre(0), "blocks.0.hook_resid_pre"),
            (HookPoint::attn(3, AttnHook::Q), "blocks.3.attn.hook_q"),
            (HookPoint::attn(3, AttnHook::RotK), "blocks.3.attn.hook_rot_k"),
            (HookPoint::attn_scores(7), "blocks.7.attn.hook_attn_scores"),
            (HookPoint::pattern(5), "blocks.5.attn.hook_pattern"),
            (HookPoint::z(5), "blocks.5.attn.hook_z"),
            (HookPoint::attn_out(2), "blocks.2.hook_attn_out"),
            (HookPoint::resid_mid(11), "blocks.11.hook_resid_mid"),
            (HookPoint::mlp_pre(1), "blocks.1.mlp.hook_pre"),
            (
                HookPoint::MlpPreLinear(Layer::blocks(1)),
                "blocks.1.mlp.hook_pre_linear",
            ),
            (HookPoint::mlp_post(1), "blocks.1.mlp.hook_post"),
            (HookPoint::mlp_out(4), "blocks.4.hook_mlp_out"),
            (HookPoint::resid_post(9), "blocks.9.hook_resid_post"),
            (HookPoint::ln1_scale(3), "blocks.3.ln1.hook_scale"),
            (HookPoint::ln_final_scale(), "ln_final.hook_scale"),
            (
                HookPoint::NormNormalized(NormSite::Final(Stack::Blocks)),
                "ln_final.hook_normalized",
            ),
            (
                HookPoint::NormScale(NormSite::Final(Stack::Decoder)),
                "decoder_final_ln.hook_scale",
            ),
            (
                HookPoint::NormScale(NormSite::EmbedLn),
                "embed_ln.hook_scale",
            ),
            (
                HookPoint::NormNormalized(NormSite::MlmHead),
                "mlm_head.ln.hook_normalized",
            ),
            (
                HookPoint::ResidPre(Layer::encoder(0)),
                "encoder.0.hook_resid_pre",
            ),
            (
                HookPoint::Attn(Layer::decoder(1), AttnSite::CrossAttn, AttnHook::Z),
                "decoder.1.cross_attn.hook_z",
            ),
            (
                HookPoint::ResidMidCross(Layer::decoder(2)),
                "decoder.2.hook_resid_mid_cross",
            ),
            (
                HookPoint::NormScale(NormSite::Ln3(Layer::decoder(0))),
                "decoder.0.ln3.hook_scale",
            ),
            (
                HookPoint::NormalizedResidPost(Layer::blocks(0)),
                "blocks.0.hook_normalized_resid_post",
            ),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        for s in ["some.unknown.hook", "blocks.x.hook_resid_pre", "blocks.0.attn.hook_nope"] {
            let hook: HookPoint = s.parse().unwrap();
            assert_eq!(hook, HookPoint::Custom(s.to_string()));
        }
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("blocks.*.hook_resid_post", "blocks.10.hook_resid_post"));
        assert!(!glob_match("blocks.*.hook_resid_post", "blocks.10.hook_resid_pre"));
        assert!(glob_match("*hook_pattern", "decoder.3.cross_attn.hook_pattern"));
        assert!(glob_match("blocks.0.*", "blocks.0.mlp.hook_post"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("a*a", "a"));
    }

    #[test]
    fn filter_from_str() {
        assert!(matches!(HookFilter::from("blocks.0.hook_resid_pre"), HookFilter::Exact(_)));
        assert!(matches!(HookFilter::from("blocks.*"), HookFilter::Pattern(_)));
        let f = HookFilter::predicate(|p| p.layer().is_some_and(|l| l.index == 2));
        assert!(f.matches(&HookPoint::mlp_out(2)));
        assert!(!f.matches(&HookPoint::Embed));
    }

    #[test]
    fn hook_spec_capture_and_query() {
        let mut spec = HookSpec::new();
        assert!(spec.is_empty());

        spec.capture(HookPoint::pattern(5));
        spec.capture("blocks.3.hook_resid_post");

        assert!(!spec.is_empty());
        assert_eq!(spec.num_captures(), 2);
        assert!(spec.is_captured(&HookPoint::pattern(5)));
        assert!(spec.is_captured(&HookPoint::resid_post(3)));
        assert!(!spec.is_captured(&HookPoint::Embed));
    }

    #[test]
    fn context_runs_hooks_in_order_then_captures() {
        let mut spec = HookSpec::new();
        spec.hook(HookPoint::Embed, Hook::transform(|t, _| Ok((t + 1.0)?)));
        spec.intervene(HookPoint::Embed, Intervention::Scale(2.0));
        spec.capture(HookPoint::Embed);
        let persistent = vec![(
            HookFilter::All,
            Hook::transform(|t, _| Ok((t * 10.0)?)),
        )];

        let mut ctx = HookContext::new(persistent, &spec);
        let x = Tensor::ones((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let y = ctx.apply(HookPoint::Embed, x).unwrap();
        // ((1 * 10) + 1) * 2 = 22
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| (v - 22.0).abs() < 1e-6));

        let cache = ctx.finish(y);
        let captured: Vec<f32> = cache
            .require(&HookPoint::Embed)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(captured.iter().all(|v| (v - 22.0).abs() < 1e-6));
    }

    #[test]
    fn shape_change_is_error() {
        let mut spec = HookSpec::new();
        spec.hook(
            HookPoint::Embed,
            Hook::transform(|t, _| Ok(t.narrow(1, 0, 1)?)),
        );
        let mut ctx = HookContext::new(Vec::new(), &spec);
        let x = Tensor::ones((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = ctx.apply(HookPoint::Embed, x).unwrap_err();
        assert!(err.to_string().contains("hook_embed"));
    }

    #[test]
    fn zero_heads_masks_head_axis() {
        let point = HookPoint::z(0);
        let x = Tensor::ones((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let y = apply_intervention(&x, &point, &Intervention::ZeroHeads(vec![1])).unwrap();
        let per_head = y.sum((0, 1, 3)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(per_head, vec![8.0, 0.0, 8.0]);

        let pattern = HookPoint::pattern(0);
        let p = Tensor::ones((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let q = apply_intervention(&p, &pattern, &Intervention::ZeroHeads(vec![0, 2])).unwrap();
        let per_head = q.sum((0, 2, 3)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(per_head, vec![0.0, 4.0, 0.0]);

        assert!(apply_intervention(&x, &point, &Intervention::ZeroHeads(vec![3])).is_err());
        assert!(
            apply_intervention(&x, &HookPoint::Embed, &Intervention::ZeroHeads(vec![0])).is_err()
        );
    }

    #[test]
    fn inactive_context_is_passthrough() {
        let spec = HookSpec::new();
        let mut ctx = HookContext::new(Vec::new(), &spec);
        assert!(!ctx.is_active());
        assert!(!ctx.wants(&HookPoint::Embed));
        let x = Tensor::ones(3, DType::F32, &Device::Cpu).unwrap();
        let y = ctx.apply(HookPoint::Embed, x).unwrap();
        assert_eq!(ctx.finish(y).num_captures(), 0);
    }
}
