use kindred_storage::AccountId;
use snafu::{Snafu, ensure};
use tokio::sync::mpsc;

use crate::app::AppServices;
use crate::billing::{PLANS, SubscriptionFlow};
use crate::chat::{ChatMessage, ConversationController, Role, SendOutcome, ViewEvent, ViewState};

pub const HELP_TEXT: &str = "\
Commands:
  /signup <name> <email> <password>  create an account and sign in
  /login <email> <password>          sign in
  /logout                            sign out
  /whoami                            show the signed-in profile
  /chat                              open the conversation
  /plans                             list subscription plans
  /select <plan>                     choose a plan
  /subscribe                         pay for the selected plan
  /help                              show this help
  /quit                              exit
Any other line is sent to the coach while the conversation is open.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SignUp {
        name: String,
        email: String,
        password: String,
    },
    LogIn {
        email: String,
        password: String,
    },
    LogOut,
    WhoAmI,
    Chat,
    Plans,
    Select {
        plan_id: String,
    },
    Subscribe,
    Help,
    Quit,
    Say {
        text: String,
    },
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ParseCommandError {
    #[snafu(display("usage: {usage}"))]
    Usage {
        stage: &'static str,
        usage: &'static str,
    },
    #[snafu(display("unknown command '/{name}', try /help"))]
    UnknownCommand { stage: &'static str, name: String },
}

pub fn parse_command(line: &str) -> Result<Command, ParseCommandError> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say {
            text: line.to_string(),
        });
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args = words.collect::<Vec<_>>();
    let expect = |count: usize, usage: &'static str| -> Result<(), ParseCommandError> {
        ensure!(
            args.len() == count,
            UsageSnafu {
                stage: "parse-command-arguments",
                usage,
            }
        );
        Ok(())
    };

    match name {
        "signup" => {
            // Display names may contain spaces; email and password never do.
            ensure!(
                args.len() >= 3,
                UsageSnafu {
                    stage: "parse-command-arguments",
                    usage: "/signup <name> <email> <password>",
                }
            );
            let (name, credentials) = args.split_at(args.len() - 2);
            Ok(Command::SignUp {
                name: name.join(" "),
                email: credentials[0].to_string(),
                password: credentials[1].to_string(),
            })
        }
        "login" => {
            expect(2, "/login <email> <password>")?;
            Ok(Command::LogIn {
                email: args[0].to_string(),
                password: args[1].to_string(),
            })
        }
        "select" => {
            expect(1, "/select <plan>")?;
            Ok(Command::Select {
                plan_id: args[0].to_string(),
            })
        }
        "logout" => expect(0, "/logout").map(|()| Command::LogOut),
        "whoami" => expect(0, "/whoami").map(|()| Command::WhoAmI),
        "chat" => expect(0, "/chat").map(|()| Command::Chat),
        "plans" => expect(0, "/plans").map(|()| Command::Plans),
        "subscribe" => expect(0, "/subscribe").map(|()| Command::Subscribe),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => UnknownCommandSnafu {
            stage: "parse-command-name",
            name: other,
        }
        .fail(),
    }
}

/// Output of one handled line.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Response {
    pub lines: Vec<String>,
    pub quit: bool,
}

impl Response {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

struct ActiveChat {
    controller: ConversationController,
    events: mpsc::UnboundedReceiver<ViewEvent>,
}

/// Terminal front end: routes commands to the identity, subscription and
/// conversation flows.
pub struct Repl {
    services: AppServices,
    flow: SubscriptionFlow,
    chat: Option<ActiveChat>,
}

impl Repl {
    pub fn new(services: AppServices) -> Self {
        let flow = services.subscription_flow();
        Self {
            services,
            flow,
            chat: None,
        }
    }

    pub fn is_chat_open(&self) -> bool {
        self.chat.is_some()
    }

    pub async fn handle_line(&mut self, line: &str) -> Response {
        let mut response = Response::default();
        self.poll_auth_change(&mut response);

        match parse_command(line) {
            Ok(command) => self.handle(command, &mut response).await,
            Err(error) => response.line(error.to_string()),
        }
        response
    }

    async fn handle(&mut self, command: Command, response: &mut Response) {
        match command {
            Command::SignUp {
                name,
                email,
                password,
            } => match self.services.identity().sign_up(&name, &email, &password).await {
                Ok(account) => {
                    self.chat = None;
                    response.line(format!(
                        "Welcome, {}. Pick a plan with /plans and /select, then /subscribe.",
                        account.display_name
                    ));
                }
                Err(error) => response.line(format!("Sign up failed: {error}")),
            },
            Command::LogIn { email, password } => {
                match self.services.identity().sign_in(&email, &password).await {
                    Ok(_) => {
                        self.chat = None;
                        self.open_chat(response).await;
                    }
                    Err(error) => response.line(format!("Sign in failed: {error}")),
                }
            }
            Command::LogOut => {
                self.services.identity().sign_out();
                self.poll_auth_change(response);
                response.line("Signed out.");
            }
            Command::WhoAmI => match self.services.identity().current_profile().await {
                Ok(Some(profile)) => response.line(format!(
                    "{} <{}>, plan: {}",
                    profile.display_name,
                    profile.email,
                    profile.subscription_plan.as_deref().unwrap_or("none")
                )),
                Ok(None) => response.line("Not signed in."),
                Err(error) => response.line(format!("Could not load profile: {error}")),
            },
            Command::Chat => self.open_chat(response).await,
            Command::Plans => {
                for plan in &PLANS {
                    response.line(format!(
                        "{:<10} {} {:<8} {}",
                        plan.id,
                        plan.name,
                        plan.price_label(),
                        plan.description
                    ));
                    for feature in plan.features() {
                        response.line(format!("             - {feature}"));
                    }
                }
            }
            Command::Select { plan_id } => match self.flow.select(&plan_id) {
                Ok(plan) => response.line(format!("Selected {} ({}).", plan.name, plan.price_label())),
                Err(error) => response.line(error.to_string()),
            },
            Command::Subscribe => self.subscribe(response).await,
            Command::Help => response.line(HELP_TEXT),
            Command::Quit => response.quit = true,
            Command::Say { text } => self.say(text, response).await,
        }
    }

    async fn current_account(&self) -> Option<AccountId> {
        self.services.session_gate().current_account().await
    }

    async fn subscribe(&mut self, response: &mut Response) {
        let Some(account_id) = self.current_account().await else {
            response.line("Please sign in first with /login.");
            return;
        };
        match self.flow.checkout(account_id).await {
            Ok(_) => {
                response.line("Subscription active.");
                self.open_chat(response).await;
            }
            Err(error) => response.line(error.user_message()),
        }
    }

    async fn open_chat(&mut self, response: &mut Response) {
        let (sender, events) = mpsc::unbounded_channel();
        let mut controller = self.services.conversation(sender);
        controller.activate().await;

        let mut chat = ActiveChat { controller, events };
        if drain_redirect(&mut chat.events) {
            self.chat = None;
            response.line("Please sign in first with /login.");
            return;
        }
        for message in chat.controller.messages() {
            response.line(render(message));
        }
        self.chat = Some(chat);
    }

    async fn say(&mut self, text: String, response: &mut Response) {
        let Some(chat) = self.chat.as_mut() else {
            if !text.is_empty() {
                response.line("Open the conversation with /chat first.");
            }
            return;
        };

        let before = chat.controller.messages().len();
        chat.controller.set_input(text);
        let outcome = chat.controller.send().await;
        for message in &chat.controller.messages()[before..] {
            if message.role == Role::Assistant {
                response.line(render(message));
            }
        }
        if outcome == SendOutcome::Redirected || drain_redirect(&mut chat.events) {
            self.chat = None;
            response.line("Your session ended. Please sign in again with /login.");
        }
    }

    fn poll_auth_change(&mut self, response: &mut Response) {
        let Some(chat) = self.chat.as_mut() else {
            return;
        };
        chat.controller.handle_auth_change();
        if chat.controller.state() == ViewState::Redirected {
            drain_redirect(&mut chat.events);
            self.chat = None;
            response.line("Conversation closed.");
        }
    }
}

fn drain_redirect(events: &mut mpsc::UnboundedReceiver<ViewEvent>) -> bool {
    let mut redirected = false;
    while let Ok(event) = events.try_recv() {
        redirected |= matches!(event, ViewEvent::Redirect { .. });
    }
    redirected
}

fn render(message: &ChatMessage) -> String {
    match message.role {
        Role::User => format!("you: {}", message.content),
        Role::Assistant => format!("coach: {}", message.content),
    }
}
