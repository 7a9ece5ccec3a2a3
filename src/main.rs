use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

const CONFIG_PATH: &str = "config.yaml";
const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:3001";
const DEFAULT_STATE_PATH: &str = "estadoGrupos.json";
const TEMP_FILE_SUFFIX: &str = ".tmp";

const COMMAND_PREFIX: &str = "!";
const DEFAULT_DOMAIN: &str = "@s.whatsapp.net";
const GROUP_SUFFIX: &str = "@g.us";

const METADATA_RETRIES: u32 = 3;
const METADATA_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

// Baileys sinaliza logout com o código 401; todo o resto permite reconectar.
const LOGGED_OUT_CODE: u16 = 401;

const DEFAULT_WELCOME_MESSAGE: &str = "Seja bem-vindo(a) ao grupo! 🎉";
const DEFAULT_MARK_MESSAGE: &str = "📢 Atenção, todos os participantes! ⬇️";

const HELP_TEXT: &str = "\
💬 *Comandos disponíveis:*

1️⃣ *!marcar* - Marca todos os participantes do grupo. 📣
2️⃣ *!mensagemmarcar* - Altera a mensagem usada no comando !marcar. ✏️
3️⃣ *!ban* - Banir um participante do grupo. 🚫
4️⃣ *!sorteio* - Realizar um sorteio entre os participantes. 🎉
5️⃣ *!mensagem* - Configura a mensagem automática do grupo. 📝
6️⃣ *!promover* - Promove um membro a administrador. 🛡️
7️⃣ *!apagar* - Apaga uma mensagem para todos. 🗑️
8️⃣ *!fechar* - Fecha o grupo para mensagens. 🔒
9️⃣ *!abrir* - Abre o grupo para mensagens. 🔓

*Teste agora e divirta-se! 😎*";

#[derive(Debug, Clone, Default, Deserialize)]
struct Config {
    gateway_url: Option<String>,
    state_path: Option<String>,
    log_level: Option<String>,
}

fn load_config() -> Config {
    let text = match std::fs::read_to_string(CONFIG_PATH) {
        Ok(text) => text,
        Err(_) => return Config::default(),
    };
    match serde_yaml::from_str(&text) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("erro ao ler {CONFIG_PATH}: {err}; usando configuração padrão");
            Config::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminRole {
    Admin,
    Superadmin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(default)]
    pub admin: Option<AdminRole>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub participants: Vec<Participant>,
}

impl GroupMetadata {
    pub fn is_admin(&self, jid: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.id == jid && p.admin.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotedRef {
    pub id: String,
    pub participant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub chat: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub quoted: Option<QuotedRef>,
}

impl InboundMessage {
    pub fn sender(&self) -> &str {
        self.sender.as_deref().unwrap_or(&self.chat)
    }

    pub fn is_group(&self) -> bool {
        self.chat.ends_with(GROUP_SUFFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSetting {
    Announcement,
    NotAnnouncement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantsUpdate {
    pub group: String,
    pub action: ParticipantAction,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    LoggedOut,
    Other(u16),
}

#[derive(Debug)]
pub enum ConnectionUpdate {
    Connecting,
    Open,
    Qr(String),
    Close(DisconnectReason),
}

#[derive(Debug)]
pub enum Event {
    Connection(ConnectionUpdate),
    Message(InboundMessage),
    Participants(ParticipantsUpdate),
}

/// Fronteira com o cliente de mensagens. Tudo que é difícil (sessão, cripto,
/// sincronização multi-dispositivo) vive do outro lado; aqui só entram as
/// operações que o dispatcher precisa.
#[async_trait]
pub trait ChatSocket: Send + Sync {
    fn self_id(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, jid: &str, text: &str, mentions: &[String]) -> Result<()>;
    async fn delete_message(&self, jid: &str, target: &QuotedRef) -> Result<()>;
    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata>;
    async fn participants_update(
        &self,
        jid: &str,
        participants: &[String],
        action: ParticipantAction,
    ) -> Result<()>;
    async fn group_setting_update(&self, jid: &str, setting: GroupSetting) -> Result<()>;
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self) -> Result<(Arc<dyn ChatSocket>, mpsc::UnboundedReceiver<Event>)>;
}

pub fn derive_bot_jid(raw: &str) -> String {
    let user = raw.split(':').next().unwrap_or(raw);
    let user = user.split('@').next().unwrap_or(user);
    format!("{user}{DEFAULT_DOMAIN}")
}

fn user_number(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

pub struct GroupStore {
    path: PathBuf,
    activated: HashMap<String, bool>,
}

impl GroupStore {
    pub fn load(path: PathBuf) -> Self {
        let activated = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(map) => map,
                Err(err) => {
                    error!("erro ao carregar o estado dos grupos: {err}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, activated }
    }

    pub fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.activated)?;
        let tmp = PathBuf::from(format!("{}{}", self.path.display(), TEMP_FILE_SUFFIX));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn is_activated(&self, group_id: &str) -> bool {
        self.activated.get(group_id).copied().unwrap_or(false)
    }

    pub fn set_activated(&mut self, group_id: &str, on: bool) {
        self.activated.insert(group_id.to_string(), on);
    }
}

pub struct BotState {
    pub store: GroupStore,
    pub mark_messages: HashMap<String, String>,
    pub welcome_message: String,
}

impl BotState {
    pub fn new(store: GroupStore) -> Self {
        Self {
            store,
            mark_messages: HashMap::new(),
            welcome_message: DEFAULT_WELCOME_MESSAGE.to_string(),
        }
    }
}

pub async fn fetch_group_metadata(
    socket: &dyn ChatSocket,
    group_id: &str,
    retries: u32,
    attempt_timeout: Duration,
) -> Option<GroupMetadata> {
    for attempt in 1..=retries {
        match tokio::time::timeout(attempt_timeout, socket.group_metadata(group_id)).await {
            Ok(Ok(metadata)) => return Some(metadata),
            Ok(Err(err)) if attempt < retries => {
                warn!(
                    "erro ao obter metadata do grupo {group_id}, tentativa {attempt}/{retries}: {err}"
                );
            }
            Err(_) if attempt < retries => {
                warn!("timeout ao obter metadata do grupo {group_id}, tentativa {attempt}/{retries}");
            }
            Ok(Err(err)) => {
                error!(
                    "falha ao recuperar metadata após {retries} tentativas para o grupo {group_id}: {err}"
                );
            }
            Err(_) => {
                error!(
                    "falha ao recuperar metadata após {retries} tentativas para o grupo {group_id}: timeout"
                );
            }
        }
    }
    None
}

async fn send_logged(socket: &dyn ChatSocket, jid: &str, text: &str, mentions: &[String]) {
    if let Err(err) = socket.send_text(jid, text, mentions).await {
        warn!("falha ao enviar mensagem para {jid}: {err}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Ativar,
    Desativar,
    Marcar,
    MensagemMarcar,
    Sorteio,
    Comandos,
    Ban,
    Promover,
    Mensagem,
    Apagar,
    Fechar,
    Abrir,
}

// Ordem de prioridade literal; !mensagemmarcar precisa vir antes de !mensagem.
const COMMANDS: &[(&str, CommandKind)] = &[
    ("!ativarbot", CommandKind::Ativar),
    ("!desativarbot", CommandKind::Desativar),
    ("!marcar", CommandKind::Marcar),
    ("!mensagemmarcar", CommandKind::MensagemMarcar),
    ("!sorteio", CommandKind::Sorteio),
    ("!comandos", CommandKind::Comandos),
    ("!ban", CommandKind::Ban),
    ("!promover", CommandKind::Promover),
    ("!mensagem", CommandKind::Mensagem),
    ("!apagar", CommandKind::Apagar),
    ("!fechar", CommandKind::Fechar),
    ("!abrir", CommandKind::Abrir),
];

pub fn parse_command(text: &str) -> Option<CommandKind> {
    COMMANDS
        .iter()
        .find(|(prefix, _)| text.starts_with(prefix))
        .map(|(_, kind)| *kind)
}

fn trailing_text(text: &str) -> Option<String> {
    let rest = text.split_once(' ')?.1.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

struct CommandContext<'a> {
    state: &'a Mutex<BotState>,
    socket: &'a dyn ChatSocket,
    msg: &'a InboundMessage,
    metadata: &'a GroupMetadata,
    bot_jid: &'a str,
}

impl CommandContext<'_> {
    async fn reply(&self, text: &str) {
        send_logged(self.socket, &self.msg.chat, text, &[]).await;
    }
}

pub async fn handle_message(state: &Mutex<BotState>, socket: &dyn ChatSocket, msg: &InboundMessage) {
    if !socket.is_open() {
        return;
    }

    let Some(metadata) =
        fetch_group_metadata(socket, &msg.chat, METADATA_RETRIES, METADATA_TIMEOUT).await
    else {
        return;
    };

    if !msg.is_group() {
        return;
    }

    let text = msg.text.as_str();
    let activated = state.lock().await.store.is_activated(&msg.chat);
    if !activated && !text.starts_with("!ativarbot") {
        return;
    }

    let bot_jid = derive_bot_jid(&socket.self_id());
    let sender_admin = metadata.is_admin(msg.sender());
    let bot_admin = metadata.is_admin(&bot_jid);
    let is_command = text.starts_with(COMMAND_PREFIX);

    // Sem admin o bot não consegue agir; nem responde.
    if !bot_admin && is_command {
        return;
    }

    if !sender_admin && is_command {
        send_logged(
            socket,
            &msg.chat,
            "🚫 Você precisa ser admin para usar este comando!",
            &[],
        )
        .await;
        return;
    }

    let Some(kind) = parse_command(text) else {
        return;
    };

    let ctx = CommandContext {
        state,
        socket,
        msg,
        metadata: &metadata,
        bot_jid: &bot_jid,
    };
    execute_command(kind, &ctx).await;
}

async fn execute_command(kind: CommandKind, ctx: &CommandContext<'_>) {
    match kind {
        CommandKind::Ativar => toggle_activation(ctx, true).await,
        CommandKind::Desativar => toggle_activation(ctx, false).await,
        CommandKind::Marcar => cmd_marcar(ctx).await,
        CommandKind::MensagemMarcar => cmd_mensagem_marcar(ctx).await,
        CommandKind::Sorteio => cmd_sorteio(ctx).await,
        CommandKind::Comandos => ctx.reply(HELP_TEXT).await,
        CommandKind::Ban => cmd_participants(ctx, ParticipantAction::Remove).await,
        CommandKind::Promover => cmd_participants(ctx, ParticipantAction::Promote).await,
        CommandKind::Mensagem => cmd_mensagem(ctx).await,
        CommandKind::Apagar => cmd_apagar(ctx).await,
        CommandKind::Fechar => {
            cmd_setting(
                ctx,
                GroupSetting::Announcement,
                "🔒 Grupo fechado para mensagens!",
            )
            .await
        }
        CommandKind::Abrir => {
            cmd_setting(
                ctx,
                GroupSetting::NotAnnouncement,
                "🔓 Grupo aberto para mensagens!",
            )
            .await
        }
    }
}

// Ativação é do proprietário (a própria conta do bot), não de qualquer admin.
async fn toggle_activation(ctx: &CommandContext<'_>, enable: bool) {
    if ctx.msg.sender() != ctx.bot_jid {
        let reply = if enable {
            "🚫 Apenas o proprietário do bot pode ativar o bot neste grupo."
        } else {
            "🚫 Apenas o proprietário do bot pode desativar o bot neste grupo."
        };
        ctx.reply(reply).await;
        return;
    }

    {
        let mut st = ctx.state.lock().await;
        st.store.set_activated(&ctx.msg.chat, enable);
        if let Err(err) = st.store.save() {
            error!("erro ao salvar o estado dos grupos: {err}");
        }
    }

    let reply = if enable {
        "✅ Bot ativado neste grupo!"
    } else {
        "❌ Bot desativado neste grupo."
    };
    ctx.reply(reply).await;
}

async fn cmd_marcar(ctx: &CommandContext<'_>) {
    let members: Vec<String> = ctx
        .metadata
        .participants
        .iter()
        .map(|p| p.id.clone())
        .collect();

    if members.is_empty() {
        ctx.reply("🚫 Nenhum participante encontrado no grupo.").await;
        return;
    }

    let text = ctx
        .state
        .lock()
        .await
        .mark_messages
        .get(&ctx.msg.chat)
        .cloned()
        .unwrap_or_else(|| DEFAULT_MARK_MESSAGE.to_string());

    send_logged(ctx.socket, &ctx.msg.chat, &text, &members).await;
}

async fn cmd_mensagem_marcar(ctx: &CommandContext<'_>) {
    let Some(new_message) = trailing_text(&ctx.msg.text) else {
        ctx.reply("🚫 Forneça a nova mensagem para o comando !marcar.")
            .await;
        return;
    };

    ctx.state
        .lock()
        .await
        .mark_messages
        .insert(ctx.msg.chat.clone(), new_message.clone());

    ctx.reply(&format!(
        "✅ Mensagem do *!marcar* atualizada para:\n\n\"{new_message}\""
    ))
    .await;
}

async fn cmd_sorteio(ctx: &CommandContext<'_>) {
    let eligible: Vec<&String> = ctx
        .metadata
        .participants
        .iter()
        .map(|p| &p.id)
        .filter(|id| id.as_str() != ctx.bot_jid)
        .collect();

    if eligible.is_empty() {
        ctx.reply("🚫 Nenhum participante elegível para o sorteio.")
            .await;
        return;
    }

    let winner = {
        let mut rng = rand::thread_rng();
        eligible.choose(&mut rng).map(|id| (*id).clone())
    };
    let Some(winner) = winner else {
        return;
    };

    send_logged(
        ctx.socket,
        &ctx.msg.chat,
        &format!(
            "🎉 Parabéns @{}! Você foi o(a) sorteado(a)!",
            user_number(&winner)
        ),
        std::slice::from_ref(&winner),
    )
    .await;
}

async fn cmd_participants(ctx: &CommandContext<'_>, action: ParticipantAction) {
    let (prompt, ok_reply, err_reply) = match action {
        ParticipantAction::Remove => (
            "🚫 Marque alguém para banir.",
            "✅ Usuário removido com sucesso.",
            "❌ Erro ao tentar remover.",
        ),
        _ => (
            "🚫 Marque alguém para promover.",
            "✅ Usuário promovido com sucesso.",
            "❌ Erro ao tentar promover.",
        ),
    };

    let Some(target) = ctx.msg.mentions.first() else {
        ctx.reply(prompt).await;
        return;
    };

    match ctx
        .socket
        .participants_update(&ctx.msg.chat, std::slice::from_ref(target), action)
        .await
    {
        Ok(()) => ctx.reply(ok_reply).await,
        Err(err) => {
            warn!("falha na mutação de participante em {}: {err}", ctx.msg.chat);
            ctx.reply(err_reply).await;
        }
    }
}

async fn cmd_mensagem(ctx: &CommandContext<'_>) {
    let Some(new_message) = trailing_text(&ctx.msg.text) else {
        ctx.reply("🚫 Forneça uma nova mensagem!").await;
        return;
    };

    ctx.state.lock().await.welcome_message = new_message.clone();

    ctx.reply(&format!(
        "✅ Mensagem automática definida como:\n\"{new_message}\""
    ))
    .await;
}

async fn cmd_apagar(ctx: &CommandContext<'_>) {
    let Some(quoted) = ctx.msg.quoted.as_ref() else {
        ctx.reply("🚫 Você precisa *responder* a mensagem que deseja apagar usando *!apagar*!")
            .await;
        return;
    };

    if let Err(err) = ctx.socket.delete_message(&ctx.msg.chat, quoted).await {
        error!("erro ao apagar mensagem em {}: {err}", ctx.msg.chat);
        ctx.reply("❌ Erro ao tentar apagar. Talvez o bot não tenha permissão suficiente.")
            .await;
    }
}

async fn cmd_setting(ctx: &CommandContext<'_>, setting: GroupSetting, reply: &str) {
    match ctx.socket.group_setting_update(&ctx.msg.chat, setting).await {
        Ok(()) => ctx.reply(reply).await,
        Err(err) => warn!("falha ao alterar modo do grupo {}: {err}", ctx.msg.chat),
    }
}

// Boas-vindas não exigem bot admin; comportamento herdado e mantido.
pub async fn handle_participants(
    state: &Mutex<BotState>,
    socket: &dyn ChatSocket,
    update: &ParticipantsUpdate,
) {
    let Some(metadata) =
        fetch_group_metadata(socket, &update.group, METADATA_RETRIES, METADATA_TIMEOUT).await
    else {
        return;
    };

    if update.action != ParticipantAction::Add {
        return;
    }

    let (activated, welcome) = {
        let st = state.lock().await;
        (
            st.store.is_activated(&update.group),
            st.welcome_message.clone(),
        )
    };
    if !activated {
        return;
    }

    for participant in &update.participants {
        let text = format!(
            "{welcome}\n👋 Olá @{}, seja bem-vindo(a) ao grupo *{}*!",
            user_number(participant),
            metadata.subject
        );
        send_logged(
            socket,
            &update.group,
            &text,
            std::slice::from_ref(participant),
        )
        .await;
    }
}

fn render_qr(data: &str) {
    match qrcode::QrCode::new(data) {
        Ok(code) => {
            let art = code.render::<qrcode::render::unicode::Dense1x2>().build();
            println!("{art}");
        }
        Err(err) => warn!("falha ao renderizar o QR de pareamento: {err}"),
    }
}

pub struct Supervisor<F> {
    pub factory: F,
    pub state: Arc<Mutex<BotState>>,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
}

impl<F: SocketFactory> Supervisor<F> {
    pub fn new(factory: F, state: Arc<Mutex<BotState>>) -> Self {
        Self {
            factory,
            state,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            let (socket, mut events) = match self.factory.connect().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!("falha ao conectar: {err}");
                    if attempts >= self.max_attempts {
                        error!("número máximo de reconexões atingido");
                        return Ok(());
                    }
                    attempts += 1;
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };

            match self.drive(socket, &mut events, &mut attempts).await {
                DisconnectReason::LoggedOut => {
                    info!("sessão encerrada pelo servidor (logout); não reconectando");
                    return Ok(());
                }
                DisconnectReason::Other(code) => {
                    warn!("conexão encerrada (código {code}); reconectando...");
                    if attempts >= self.max_attempts {
                        error!("número máximo de reconexões atingido");
                        return Ok(());
                    }
                    attempts += 1;
                    tokio::time::sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    async fn drive(
        &self,
        socket: Arc<dyn ChatSocket>,
        events: &mut mpsc::UnboundedReceiver<Event>,
        attempts: &mut u32,
    ) -> DisconnectReason {
        while let Some(event) = events.recv().await {
            match event {
                Event::Connection(ConnectionUpdate::Connecting) => {
                    debug!("conectando ao gateway...");
                }
                Event::Connection(ConnectionUpdate::Open) => {
                    info!("✅ bot conectado");
                    *attempts = 0;
                }
                Event::Connection(ConnectionUpdate::Qr(code)) => render_qr(&code),
                Event::Connection(ConnectionUpdate::Close(reason)) => return reason,
                Event::Message(msg) => {
                    handle_message(&self.state, socket.as_ref(), &msg).await;
                }
                Event::Participants(update) => {
                    handle_participants(&self.state, socket.as_ref(), &update).await;
                }
            }
        }
        // Stream terminou sem frame de close: trata como queda anormal.
        DisconnectReason::Other(0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum GatewayFrame {
    Connection(ConnectionFrame),
    Message(InboundMessage),
    Participants(ParticipantsUpdate),
    Metadata(MetadataFrame),
}

#[derive(Debug, Deserialize)]
struct ConnectionFrame {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    me: Option<String>,
    #[serde(default)]
    qr: Option<String>,
    #[serde(default)]
    reason_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct MetadataFrame {
    id: u64,
    #[serde(default)]
    metadata: Option<GroupMetadata>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum GatewayRequest<'a> {
    Send {
        jid: &'a str,
        text: &'a str,
        mentions: &'a [String],
    },
    Delete {
        jid: &'a str,
        message_id: &'a str,
        participant: &'a str,
    },
    Metadata {
        id: u64,
        jid: &'a str,
    },
    Participants {
        jid: &'a str,
        participants: &'a [String],
        change: ParticipantAction,
    },
    Setting {
        jid: &'a str,
        setting: GroupSetting,
    },
}

type MetadataResult = Result<GroupMetadata, String>;

/// Cliente do gateway Baileys: frames JSON sobre WebSocket. O gateway cuida
/// de sessão e criptografia; este lado só traduz frames em eventos e RPCs.
pub struct GatewaySocket {
    self_id: SyncMutex<String>,
    open: AtomicBool,
    next_id: AtomicU64,
    pending: SyncMutex<HashMap<u64, oneshot::Sender<MetadataResult>>>,
    out_tx: mpsc::UnboundedSender<WsMessage>,
}

struct PendingGuard<'a> {
    pending: &'a SyncMutex<HashMap<u64, oneshot::Sender<MetadataResult>>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl GatewaySocket {
    pub async fn connect(url: &str) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Event>)> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("conectando ao gateway {url}"))?;
        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();

        let socket = Arc::new(GatewaySocket {
            self_id: SyncMutex::new(String::new()),
            open: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            pending: SyncMutex::new(HashMap::new()),
            out_tx,
        });

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = write.send(msg).await {
                    warn!("erro ao enviar frame ao gateway: {err}");
                    break;
                }
            }
        });

        let reader = Arc::clone(&socket);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => reader.process_frame(&text, &event_tx),
                    Ok(WsMessage::Ping(payload)) => {
                        let _ = reader.out_tx.send(WsMessage::Pong(payload));
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("erro no stream do gateway: {err}");
                        break;
                    }
                }
            }
            reader.open.store(false, Ordering::SeqCst);
        });

        Ok((socket, event_rx))
    }

    fn process_frame(&self, text: &str, events: &mpsc::UnboundedSender<Event>) {
        let frame: GatewayFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("frame inválido do gateway: {err}");
                return;
            }
        };

        match frame {
            GatewayFrame::Connection(conn) => {
                if let Some(me) = conn.me {
                    *self.self_id.lock() = me;
                }
                if let Some(qr) = conn.qr {
                    let _ = events.send(Event::Connection(ConnectionUpdate::Qr(qr)));
                }
                match conn.status.as_deref() {
                    Some("connecting") => {
                        let _ = events.send(Event::Connection(ConnectionUpdate::Connecting));
                    }
                    Some("open") => {
                        self.open.store(true, Ordering::SeqCst);
                        let _ = events.send(Event::Connection(ConnectionUpdate::Open));
                    }
                    Some("close") => {
                        self.open.store(false, Ordering::SeqCst);
                        let reason = match conn.reason_code {
                            Some(LOGGED_OUT_CODE) => DisconnectReason::LoggedOut,
                            code => DisconnectReason::Other(code.unwrap_or(0)),
                        };
                        let _ = events.send(Event::Connection(ConnectionUpdate::Close(reason)));
                    }
                    _ => {}
                }
            }
            GatewayFrame::Message(msg) => {
                let _ = events.send(Event::Message(msg));
            }
            GatewayFrame::Participants(update) => {
                let _ = events.send(Event::Participants(update));
            }
            GatewayFrame::Metadata(resp) => {
                let waiter = self.pending.lock().remove(&resp.id);
                if let Some(tx) = waiter {
                    let result = match resp.metadata {
                        Some(metadata) => Ok(metadata),
                        None => Err(resp
                            .error
                            .unwrap_or_else(|| "metadata indisponível".to_string())),
                    };
                    let _ = tx.send(result);
                }
            }
        }
    }

    fn send_frame(&self, request: &GatewayRequest<'_>) -> Result<()> {
        let json = serde_json::to_string(request)?;
        self.out_tx
            .send(WsMessage::Text(json))
            .map_err(|_| anyhow!("conexão com o gateway encerrada"))
    }
}

#[async_trait]
impl ChatSocket for GatewaySocket {
    fn self_id(&self) -> String {
        self.self_id.lock().clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, jid: &str, text: &str, mentions: &[String]) -> Result<()> {
        self.send_frame(&GatewayRequest::Send { jid, text, mentions })
    }

    async fn delete_message(&self, jid: &str, target: &QuotedRef) -> Result<()> {
        self.send_frame(&GatewayRequest::Delete {
            jid,
            message_id: &target.id,
            participant: &target.participant,
        })
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // Se o timeout do chamador cancelar este future, o guard tira a
        // entrada da tabela de pendências.
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        self.send_frame(&GatewayRequest::Metadata { id, jid })?;
        match rx.await {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(err)) => Err(anyhow!(err)),
            Err(_) => Err(anyhow!("gateway não respondeu à consulta de metadata")),
        }
    }

    async fn participants_update(
        &self,
        jid: &str,
        participants: &[String],
        action: ParticipantAction,
    ) -> Result<()> {
        self.send_frame(&GatewayRequest::Participants {
            jid,
            participants,
            change: action,
        })
    }

    async fn group_setting_update(&self, jid: &str, setting: GroupSetting) -> Result<()> {
        self.send_frame(&GatewayRequest::Setting { jid, setting })
    }
}

pub struct GatewayFactory {
    pub url: String,
}

#[async_trait]
impl SocketFactory for GatewayFactory {
    async fn connect(&self) -> Result<(Arc<dyn ChatSocket>, mpsc::UnboundedReceiver<Event>)> {
        let (socket, events) = GatewaySocket::connect(&self.url).await?;
        Ok((socket as Arc<dyn ChatSocket>, events))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = load_config();

    let filter = cfg.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("iniciando o bot...");

    let state_path = cfg
        .state_path
        .clone()
        .unwrap_or_else(|| DEFAULT_STATE_PATH.to_string());
    let store = GroupStore::load(PathBuf::from(state_path));
    let state = Arc::new(Mutex::new(BotState::new(store)));

    let url = cfg
        .gateway_url
        .clone()
        .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());
    let supervisor = Supervisor::new(GatewayFactory { url }, state);

    supervisor.run().await?;

    // Estado terminal: o processo fica vivo, inerte, até ser reiniciado.
    info!("bot inativo; aguardando Ctrl-C");
    tokio::signal::ctrl_c().await?;
    Ok(())
}
