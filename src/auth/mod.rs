//! Session credentials: bearer token, step-up PIN token and role hints.

pub mod cookie;
pub mod role;
pub mod session;
pub mod step_up;
pub mod token;

pub use cookie::{Cookie, CookieStore, MemoryCookieJar, SameSite};
pub use role::{is_admin, Role, RoleClaim, RoleResolver, TokenVerifier, VerifiedUser};
pub use session::{Session, SessionBus, SessionEvent, SessionScoped};
pub use step_up::{
  CredentialGate, Dispatch, GateConfig, PinPrompt, PinSource, StepUpToken, MAX_PIN_ATTEMPTS,
  STEP_UP_COOKIE, STEP_UP_MAX_AGE_SECS,
};
pub use token::{TokenClaims, TokenStore};
