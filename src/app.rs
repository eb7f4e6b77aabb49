use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth::{
  CredentialGate, MemoryCookieJar, RoleResolver, Session, SessionBus, SessionEvent, TokenStore,
};
use crate::clock;
use crate::config::Config;
use crate::event::{Event, EventHandler, PollOutcome};
use crate::loyalty::{LoyaltyClient, ResourceKey, SyncedLoyaltyClient};
use crate::sync::{
  AdaptiveInterval, Direction, Liveness, PageVisibility, PollHandle, PollScheduler, SyncOptions,
};

/// What `watch` keeps polling
#[derive(Debug, Clone)]
pub struct WatchTarget {
  pub customer: String,
  pub coupon: Option<String>,
}

/// Headless application state
pub struct App {
  /// Application configuration
  config: Config,

  /// Cached loyalty client
  client: SyncedLoyaltyClient,

  session: Arc<Session>,

  /// Never hidden; held so the scheduler's visibility channel stays open
  _visibility: PageVisibility,

  scheduler: PollScheduler,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(config, token)
  }

  pub fn with_token(config: Config, token: String) -> Result<Self> {
    let clock = clock::system();
    let bus = SessionBus::new();
    let tokens = Arc::new(TokenStore::with_token(token));

    let client = LoyaltyClient::new(&config.client_config()?, tokens.clone())
      .map_err(|e| eyre!("Failed to create loyalty client: {}", e))?;
    let api = Arc::new(client.clone());

    let gate = Arc::new(CredentialGate::new(
      Arc::new(MemoryCookieJar::new(clock.clone())),
      api.clone(),
      clock.clone(),
      config.gate_config(),
    ));
    let roles = Arc::new(
      RoleResolver::new(tokens.clone(), api, clock.clone(), config.role_ttl())
        .with_session_bus(bus.clone()),
    );
    let session = Arc::new(Session::new(tokens, gate, roles, bus.clone(), clock.clone()));

    let client = SyncedLoyaltyClient::new(client, config.sync_config(), clock, bus);
    client.register_with(&session);

    let visibility = PageVisibility::new();
    let scheduler = PollScheduler::new(visibility.subscribe());

    Ok(Self {
      config,
      client,
      session,
      _visibility: visibility,
      scheduler,
    })
  }

  /// Poll `target` until Ctrl-C or until the session ends.
  pub async fn watch(&self, target: WatchTarget) -> Result<()> {
    if self.session.check_local_expiry() {
      return Err(eyre!("Bearer token has expired; log in again"));
    }

    let mut events = EventHandler::new();
    events.forward_changes(self.client.points_engine().subscribe());
    events.forward_changes(self.client.coupon_engine().subscribe());
    events.forward_session(self.session.bus().subscribe());
    let _expiry_watch = self.session.spawn_expiry_watch();

    // Foreground read so a bad customer id fails loudly
    let balance = self
      .client
      .points(&target.customer, SyncOptions::foreground())
      .await
      .map_err(|e| eyre!("Failed to load points for {}: {}", target.customer, e))?;
    info!(customer = %target.customer, points = balance.points, "watching");

    let mut interval = self.config.poll_interval();
    let mut poller = self.start_poller(&target, interval.current(), events.sender());

    loop {
      let event = tokio::select! {
        event = events.next() => event,
        _ = tokio::signal::ctrl_c() => {
          info!("interrupted, shutting down");
          break;
        }
      };

      let Some(event) = event else {
        break;
      };

      match event {
        Event::Polled(outcome) => {
          if let PollOutcome::Failed(error) = &outcome {
            warn!(%error, "poll failed");
          }
          if next_interval(&mut interval, &outcome) {
            info!(interval_ms = interval.current().as_millis() as u64, "poll interval changed");
            poller = self.start_poller(&target, interval.current(), events.sender());
          }
        }
        Event::Changed(change) => {
          let sign = match change.direction {
            Direction::Up => '+',
            Direction::Down => '-',
          };
          info!(key = %change.key, "{}{}", sign, change.delta);
        }
        Event::Session(SessionEvent::LoginRequired) => {
          drop(poller);
          self.client.dispose();
          return Err(eyre!("Session ended; log in again"));
        }
        Event::Session(_) => {}
      }
    }

    drop(poller);
    self.client.dispose();
    Ok(())
  }

  /// Print the role resolved locally, then the one the server reports.
  pub async fn show_role(&self) -> Result<()> {
    let roles = self.session.roles();
    let local = roles.get_role_fast();
    println!("local role:      {}", local);

    let reconciled = roles.spawn_refresh().await?;
    println!("reconciled role: {}", reconciled);

    for action in roles.visible_actions(&self.config.actions) {
      let marker = if action.requires_step_up { " (PIN)" } else { "" };
      println!("  {:<16} {}{}", action.id, action.label, marker);
    }
    Ok(())
  }

  fn start_poller(
    &self,
    target: &WatchTarget,
    interval: Duration,
    tx: mpsc::UnboundedSender<Event>,
  ) -> PollHandle {
    let client = self.client.clone();
    let target = target.clone();

    self.scheduler.start(
      move |live: Liveness| {
        let client = client.clone();
        let target = target.clone();
        let tx = tx.clone();
        async move {
          let outcome = poll_once(&client, &target).await;
          if live.is_alive() {
            let _ = tx.send(Event::Polled(outcome));
          }
        }
      },
      interval,
    )
  }
}

async fn poll_once(client: &SyncedLoyaltyClient, target: &WatchTarget) -> PollOutcome {
  let key = ResourceKey::points(&target.customer).to_string();
  let before = client.points_engine().entry(&key);

  let coupon = async {
    if let Some(coupon) = &target.coupon {
      // Coupon failures are logged by the engine and never change the cadence
      let _ = client.coupon_inventory(coupon, SyncOptions::silent()).await;
    }
  };
  let (points, ()) = futures::join!(
    client.points(&target.customer, SyncOptions::silent()),
    coupon
  );

  let balance = match points {
    Ok(balance) => balance,
    Err(error) => return PollOutcome::Failed(error),
  };

  let Some(before) = before else {
    return PollOutcome::Unchanged;
  };
  let refetched = client
    .points_engine()
    .entry(&key)
    .is_some_and(|after| after.revision != before.revision);

  if !refetched {
    PollOutcome::Cached
  } else if before.value.points != balance.points {
    PollOutcome::Changed
  } else {
    PollOutcome::Unchanged
  }
}

/// Feed a poll outcome to the interval policy. True if the interval moved.
fn next_interval(interval: &mut AdaptiveInterval, outcome: &PollOutcome) -> bool {
  match outcome {
    PollOutcome::Changed => interval.record_change(),
    PollOutcome::Unchanged => interval.record_success(),
    PollOutcome::Failed(_) => {
      interval.record_failure();
      false
    }
    PollOutcome::Cached => false,
  }
}
